//! A typed SQL AST. Every compiled segment is built as a tree of these
//! nodes and rendered per-dialect; nothing downstream of the compiler ever
//! concatenates a user-supplied value into a SQL string directly —
//! literals are always constructed as [`Literal`] values typed by the
//! column's dtype.

use vizql_types::DType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OlapHttp,
    StreamPgwire,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Stored as an RFC 3339 string; rendered with a dialect-specific cast.
    DateTime(String),
    Null,
}

impl Literal {
    /// Builds a typed literal from a raw JSON value and the column's dtype.
    /// This is the only place user-supplied filter/formula values become
    /// AST nodes.
    pub fn typed(value: &serde_json::Value, dtype: DType) -> Literal {
        if value.is_null() {
            return Literal::Null;
        }
        match dtype {
            DType::String | DType::Object => {
                Literal::Str(value.as_str().map(str::to_owned).unwrap_or_else(|| value.to_string()))
            }
            DType::Int64 => Literal::Int(
                value
                    .as_i64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .unwrap_or_default(),
            ),
            DType::Float64 => Literal::Float(
                value
                    .as_f64()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .unwrap_or_default(),
            ),
            DType::Bool => Literal::Bool(
                value
                    .as_bool()
                    .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                    .unwrap_or_default(),
            ),
            DType::Datetime => Literal::DateTime(
                value
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| value.to_string()),
            ),
        }
    }

    pub fn render(&self, dialect: Dialect) -> String {
        match self {
            Literal::Str(s) => format!("'{}'", escape_single_quotes(s)),
            Literal::Int(i) => i.to_string(),
            Literal::Float(f) => {
                if f.fract() == 0.0 {
                    format!("{f:.1}")
                } else {
                    f.to_string()
                }
            }
            Literal::Bool(b) => match dialect {
                Dialect::OlapHttp => if *b { "1" } else { "0" }.to_string(),
                Dialect::StreamPgwire => b.to_string(),
            },
            Literal::DateTime(s) => match dialect {
                Dialect::OlapHttp => format!("toDateTime('{}')", escape_single_quotes(s)),
                Dialect::StreamPgwire => format!("TIMESTAMP '{}'", escape_single_quotes(s)),
            },
            Literal::Null => "NULL".to_string(),
        }
    }
}

fn escape_single_quotes(s: &str) -> String {
    s.replace('\'', "''")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinOp {
    pub fn render(&self) -> &'static str {
        match self {
            BinOp::Eq => "=",
            BinOp::NotEq => "!=",
            BinOp::Gt => ">",
            BinOp::Lt => "<",
            BinOp::Gte => ">=",
            BinOp::Lte => "<=",
            BinOp::And => "AND",
            BinOp::Or => "OR",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    Literal(Literal),
    Binary(Box<Expr>, BinOp, Box<Expr>),
    Not(Box<Expr>),
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    /// `CONTAINS`/`STARTS_WITH`/`ENDS_WITH` lower to `LIKE` with the pattern
    /// wildcards already positioned.
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    FunctionCall {
        name: String,
        args: Vec<Expr>,
    },
    /// `IF(cond, then, else)` from the formula sublanguage.
    Case {
        cond: Box<Expr>,
        then: Box<Expr>,
        or_else: Box<Expr>,
    },
    /// A `window` node's output column:
    /// `<function>(<args>) OVER (PARTITION BY ... ORDER BY ...)`.
    Window {
        function: String,
        args: Vec<Expr>,
        partition_by: Vec<Expr>,
        order_by: Vec<OrderByItem>,
    },
}

impl Expr {
    pub fn render(&self, dialect: Dialect) -> String {
        match self {
            Expr::Column(c) => quote_identifier(c, dialect),
            Expr::Literal(lit) => lit.render(dialect),
            Expr::Binary(l, op, r) => {
                format!("({} {} {})", l.render(dialect), op.render(), r.render(dialect))
            }
            Expr::Not(e) => format!("NOT ({})", e.render(dialect)),
            Expr::InList { expr, list, negated } => {
                let items: Vec<String> = list.iter().map(|e| e.render(dialect)).collect();
                format!(
                    "{} {}IN ({})",
                    expr.render(dialect),
                    if *negated { "NOT " } else { "" },
                    items.join(", ")
                )
            }
            Expr::Between { expr, low, high, negated } => format!(
                "{} {}BETWEEN {} AND {}",
                expr.render(dialect),
                if *negated { "NOT " } else { "" },
                low.render(dialect),
                high.render(dialect)
            ),
            Expr::Like { expr, pattern, negated } => format!(
                "{} {}LIKE {}",
                expr.render(dialect),
                if *negated { "NOT " } else { "" },
                pattern.render(dialect)
            ),
            Expr::IsNull { expr, negated } => format!(
                "{} IS {}NULL",
                expr.render(dialect),
                if *negated { "NOT " } else { "" }
            ),
            Expr::FunctionCall { name, args } => {
                let rendered: Vec<String> = args.iter().map(|a| a.render(dialect)).collect();
                format!("{}({})", name, rendered.join(", "))
            }
            Expr::Case { cond, then, or_else } => format!(
                "CASE WHEN {} THEN {} ELSE {} END",
                cond.render(dialect),
                then.render(dialect),
                or_else.render(dialect)
            ),
            Expr::Window {
                function,
                args,
                partition_by,
                order_by,
            } => {
                let rendered_args: Vec<String> = args.iter().map(|a| a.render(dialect)).collect();
                let mut over = String::new();
                if !partition_by.is_empty() {
                    let cols: Vec<String> = partition_by.iter().map(|e| e.render(dialect)).collect();
                    over.push_str("PARTITION BY ");
                    over.push_str(&cols.join(", "));
                    if !order_by.is_empty() {
                        over.push(' ');
                    }
                }
                if !order_by.is_empty() {
                    let cols: Vec<String> = order_by
                        .iter()
                        .map(|o| {
                            format!(
                                "{} {}",
                                o.expr.render(dialect),
                                if o.ascending { "ASC" } else { "DESC" }
                            )
                        })
                        .collect();
                    over.push_str("ORDER BY ");
                    over.push_str(&cols.join(", "));
                }
                format!("{}({}) OVER ({})", function, rendered_args.join(", "), over)
            }
        }
    }
}

/// Wraps `name` in the dialect's quoting convention, escaping any embedded
/// quote character by doubling it. Callers are expected to have already run
/// [`crate::errors::validate_identifier`] on the unquoted name — this quoting
/// is defense in depth, not the primary safeguard, since a `table.column`
/// identifier quotes each segment separately.
fn quote_identifier(name: &str, dialect: Dialect) -> String {
    let quote = match dialect {
        Dialect::OlapHttp => '`',
        Dialect::StreamPgwire => '"',
    };
    name.split('.')
        .map(|segment| format!("{quote}{}{quote}", segment.replace(quote, &format!("{quote}{quote}"))))
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinType {
    pub fn render(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Full => "FULL JOIN",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    pub join_type: JoinType,
    pub table: String,
    pub on: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByItem {
    pub expr: Expr,
    pub ascending: bool,
}

/// One `SELECT` statement — the unit a maximal merge-compatible chain of
/// nodes collapses into.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub distinct: bool,
    pub projection: Vec<(Expr, Option<String>)>,
    pub from: FromClause,
    pub joins: Vec<JoinClause>,
    pub where_: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderByItem>,
    /// A node-level `limit`, distinct from the request-level pagination
    /// wrapper built separately as [`PaginatedQuery`].
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromClause {
    Table(String),
    Subquery(Box<SelectStmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetOp {
    UnionAll,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetOpStmt {
    pub op: SetOp,
    pub inputs: Vec<SelectStmt>,
}

impl SelectStmt {
    pub fn new(from: FromClause) -> Self {
        Self {
            distinct: false,
            projection: Vec::new(),
            from,
            joins: Vec::new(),
            where_: None,
            group_by: Vec::new(),
            having: None,
            order_by: Vec::new(),
            limit: None,
        }
    }

    pub fn and_where(&mut self, predicate: Expr) {
        self.where_ = Some(match self.where_.take() {
            Some(existing) => Expr::Binary(Box::new(existing), BinOp::And, Box::new(predicate)),
            None => predicate,
        });
    }

    pub fn render(&self, dialect: Dialect) -> String {
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        if self.projection.is_empty() {
            sql.push('*');
        } else {
            let cols: Vec<String> = self
                .projection
                .iter()
                .map(|(expr, alias)| match alias {
                    Some(a) => format!("{} AS {}", expr.render(dialect), quote_identifier(a, dialect)),
                    None => expr.render(dialect),
                })
                .collect();
            sql.push_str(&cols.join(", "));
        }
        sql.push_str(" FROM ");
        match &self.from {
            FromClause::Table(name) => sql.push_str(name),
            FromClause::Subquery(inner) => {
                sql.push('(');
                sql.push_str(&inner.render(dialect));
                sql.push(')');
            }
        }
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join.join_type.render());
            sql.push(' ');
            sql.push_str(&join.table);
            sql.push_str(" ON ");
            sql.push_str(&join.on.render(dialect));
        }
        if let Some(where_) = &self.where_ {
            sql.push_str(" WHERE ");
            sql.push_str(&where_.render(dialect));
        }
        if !self.group_by.is_empty() {
            let cols: Vec<String> = self.group_by.iter().map(|e| e.render(dialect)).collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&cols.join(", "));
        }
        if let Some(having) = &self.having {
            sql.push_str(" HAVING ");
            sql.push_str(&having.render(dialect));
        }
        if !self.order_by.is_empty() {
            let cols: Vec<String> = self
                .order_by
                .iter()
                .map(|o| {
                    format!(
                        "{} {}",
                        o.expr.render(dialect),
                        if o.ascending { "ASC" } else { "DESC" }
                    )
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&cols.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        sql
    }
}

impl SetOpStmt {
    pub fn render(&self, dialect: Dialect) -> String {
        self.inputs
            .iter()
            .map(|s| s.render(dialect))
            .collect::<Vec<_>>()
            .join(" UNION ALL ")
    }
}

/// Integer constants appended to an `olap` segment — never interpolated
/// from user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OlapSettings {
    pub max_execution_time_s: u64,
    pub max_memory_bytes: u64,
    pub max_rows_to_read: u64,
}

impl OlapSettings {
    pub fn render(&self) -> String {
        format!(
            "SETTINGS max_execution_time={}, max_memory_usage={}, max_rows_to_read={}",
            self.max_execution_time_s, self.max_memory_bytes, self.max_rows_to_read
        )
    }
}

/// Pagination wrapper built as an explicit AST node:
/// `SELECT * FROM (<inner>) LIMIT <n> OFFSET <m>`. `limit`/`offset` are
/// already-bounded integers by the time this is constructed — never a raw
/// string splice of caller-controlled input.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginatedQuery {
    pub inner_sql: String,
    pub limit: u64,
    pub offset: u64,
}

impl PaginatedQuery {
    pub fn render(&self) -> String {
        format!(
            "SELECT * FROM ({}) LIMIT {} OFFSET {}",
            self.inner_sql, self.limit, self.offset
        )
    }
}
