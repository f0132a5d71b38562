//! Shared application state handed to every request handler: the catalog,
//! cache, store clients, session index and fan-out are all built once at
//! startup and held behind `Arc`.

use std::sync::Arc;

use vizql_cache::PreviewCache;
use vizql_core::Catalog;
use vizql_gateway::{BusSubscriber, FanOut, SessionIndex};
use vizql_router::client::{KvClient, OlapClient, StreamClient};
use vizql_router::executor::StoreClients;
use vizql_types::config::VizqlConfig;

use crate::acl::AclProvider;
use crate::widget_store::WidgetStore;

pub struct AppState {
    pub config: VizqlConfig,
    pub catalog: Arc<Catalog>,
    pub preview_cache: Arc<PreviewCache>,
    pub widget_cache: Arc<PreviewCache>,
    pub store_clients: Arc<StoreClients>,
    pub acl: Arc<dyn AclProvider>,
    pub widgets: Arc<dyn WidgetStore>,
    pub session_index: Arc<SessionIndex>,
    pub fan_out: Arc<FanOut>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: VizqlConfig,
        catalog: Arc<Catalog>,
        acl: Arc<dyn AclProvider>,
        widgets: Arc<dyn WidgetStore>,
        olap: Arc<dyn OlapClient>,
        stream: Arc<dyn StreamClient>,
        kv: Arc<dyn KvClient>,
        bus_subscriber: Arc<dyn BusSubscriber>,
    ) -> Self {
        let preview_cache = Arc::new(PreviewCache::new(
            config.preview.ttl(),
            config.cache.serve_stale_on_store_unavailable,
        ));
        let widget_cache = Arc::new(PreviewCache::new(
            config.cache.ttl(),
            config.cache.serve_stale_on_store_unavailable,
        ));
        let session_index = Arc::new(SessionIndex::new());
        let fan_out = Arc::new(FanOut::new(session_index.clone(), preview_cache.clone(), bus_subscriber));
        Self {
            config,
            catalog,
            preview_cache,
            widget_cache,
            store_clients: Arc::new(StoreClients { olap, stream, kv }),
            acl,
            widgets,
            session_index,
            fan_out,
        }
    }
}
