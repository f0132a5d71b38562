pub mod bus;
pub mod errors;
pub mod fanout;
pub mod heartbeat;
pub mod index;
pub mod service;
pub mod session;

pub use bus::{table_rows_pattern, BusSubscriber, RedisBusSubscriber, TableRowsDelta, TABLE_ROWS_KIND};
pub use errors::GatewayError;
pub use fanout::FanOut;
pub use heartbeat::{run_heartbeat_loop, MISSED_INTERVALS_BEFORE_UNCLEAN_TERMINATION};
pub use index::SessionIndex;
pub use service::{DashboardSession, PreviewService, WidgetDataService};
pub use session::{OutboundMessage, Session, SessionId, WidgetSubscription};
