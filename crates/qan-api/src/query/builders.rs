//! SQL builders for the analytics read path.
//!
//! Every builder targets the `metrics` table and adds `date` partition
//! predicates derived from the requested period so DataFusion can skip
//! partitions outside the range. Dimension and label names are mapped
//! through a whitelist; values are escaped as SQL string literals.

#![allow(clippy::format_push_string)]

use std::fmt;

use crate::schema::{columns, partition_date, METRICS_TABLE, PARTITION_DATE_FORMAT};
use crate::QanError;

/// Metric used when a request does not name one.
pub const DEFAULT_MAIN_METRIC: &str = "query_time";

/// Default and maximum number of report rows.
pub const DEFAULT_REPORT_LIMIT: u32 = 10;
pub const MAX_REPORT_LIMIT: u32 = 1_000;

/// A tag or key the read path can group and filter by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Fingerprint,
    ServiceName,
    Database,
    Schema,
    Username,
    ClientHost,
}

impl Dimension {
    pub const ALL: [Self; 6] = [
        Self::Fingerprint,
        Self::ServiceName,
        Self::Database,
        Self::Schema,
        Self::Username,
        Self::ClientHost,
    ];

    /// Tag dimensions offered by the filters endpoint.
    pub const LABELS: [Self; 5] = [
        Self::ServiceName,
        Self::Database,
        Self::Schema,
        Self::Username,
        Self::ClientHost,
    ];

    /// Parse the wire name of a dimension.
    pub fn parse(name: &str) -> Result<Self, QanError> {
        match name {
            "queryid" | "fingerprint" => Ok(Self::Fingerprint),
            "service_name" => Ok(Self::ServiceName),
            "database" => Ok(Self::Database),
            "schema" => Ok(Self::Schema),
            "username" => Ok(Self::Username),
            "client_host" => Ok(Self::ClientHost),
            other => Err(QanError::InvalidArgument(format!(
                "unknown dimension: {other}"
            ))),
        }
    }

    /// Wire name, as accepted by [`Dimension::parse`].
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fingerprint => "queryid",
            Self::ServiceName => "service_name",
            Self::Database => "database",
            Self::Schema => "schema",
            Self::Username => "username",
            Self::ClientHost => "client_host",
        }
    }

    /// Column holding this dimension.
    pub const fn column(self) -> &'static str {
        match self {
            Self::Fingerprint => columns::FINGERPRINT,
            Self::ServiceName => columns::SERVICE_NAME,
            Self::Database => columns::DATABASE,
            Self::Schema => columns::SCHEMA_NAME,
            Self::Username => columns::USERNAME,
            Self::ClientHost => columns::CLIENT_HOST,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Half-open period range `[from, to)` in unix seconds. Zero means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodRange {
    pub from: i64,
    pub to: i64,
}

impl PeriodRange {
    pub const fn new(from: i64, to: i64) -> Self {
        Self { from, to }
    }

    pub fn validate(&self) -> Result<(), QanError> {
        if self.from != 0 && self.to != 0 && self.from >= self.to {
            return Err(QanError::InvalidArgument(format!(
                "empty period range: from {} is not before to {}",
                self.from, self.to
            )));
        }
        Ok(())
    }

    /// Row predicates plus partition predicates for pruning.
    fn predicates(&self) -> String {
        let mut sql = String::new();

        if self.from != 0 {
            sql.push_str(&format!(" AND {} >= {}", columns::PERIOD_START, self.from));
            if let Some(date) = partition_date(self.from) {
                sql.push_str(&format!(
                    " AND date >= '{}'",
                    date.format(PARTITION_DATE_FORMAT)
                ));
            }
        }

        if self.to != 0 {
            sql.push_str(&format!(" AND {} < {}", columns::PERIOD_START, self.to));
            // the last second inside the range decides the upper partition
            if let Some(date) = partition_date(self.to.saturating_sub(1)) {
                sql.push_str(&format!(
                    " AND date <= '{}'",
                    date.format(PARTITION_DATE_FORMAT)
                ));
            }
        }

        sql
    }
}

/// Label constraints: each dimension must equal one of its values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    entries: Vec<(Dimension, Vec<String>)>,
}

impl LabelFilter {
    /// Build from wire `(key, values)` pairs. Keys with no values are ignored.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, QanError>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let mut entries = Vec::new();
        for (key, values) in pairs {
            if values.is_empty() {
                continue;
            }
            entries.push((Dimension::parse(key)?, values.to_vec()));
        }
        Ok(Self { entries })
    }

    fn predicates(&self) -> String {
        let mut sql = String::new();
        for (dimension, values) in &self.entries {
            let list = values
                .iter()
                .map(|v| format!("'{}'", escape_string(v)))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" AND {} IN ({list})", dimension.column()));
        }
        sql
    }
}

/// Top-N breakdown of one metric grouped by a dimension.
///
/// Result columns: `dimension, num_queries, cnt_total, sum_total, min_value, max_value`.
#[derive(Debug, Clone)]
#[must_use = "builders do nothing until .build() is called"]
pub struct ReportQueryBuilder {
    group_by: Dimension,
    metric: String,
    period: PeriodRange,
    labels: LabelFilter,
    limit: u32,
    offset: u32,
}

impl ReportQueryBuilder {
    pub fn new(group_by: Dimension, metric: impl Into<String>) -> Self {
        Self {
            group_by,
            metric: metric.into(),
            period: PeriodRange::default(),
            labels: LabelFilter::default(),
            limit: DEFAULT_REPORT_LIMIT,
            offset: 0,
        }
    }

    pub const fn period(mut self, period: PeriodRange) -> Self {
        self.period = period;
        self
    }

    pub fn labels(mut self, labels: LabelFilter) -> Self {
        self.labels = labels;
        self
    }

    /// Limit the number of rows. Zero selects the default; values above
    /// [`MAX_REPORT_LIMIT`] are clamped.
    pub fn limit(mut self, n: u32) -> Self {
        self.limit = match n {
            0 => DEFAULT_REPORT_LIMIT,
            n => n.min(MAX_REPORT_LIMIT),
        };
        self
    }

    pub const fn offset(mut self, n: u32) -> Self {
        self.offset = n;
        self
    }

    pub const fn effective_limit(&self) -> u32 {
        self.limit
    }

    fn filter(&self) -> String {
        format!(
            " WHERE {} = '{}'{}{}",
            columns::METRIC,
            escape_string(&self.metric),
            self.period.predicates(),
            self.labels.predicates()
        )
    }

    /// Build the ranked page query, heaviest total first.
    pub fn build(&self) -> String {
        let dim = self.group_by.column();
        format!(
            "SELECT {dim} AS dimension, SUM({nq}) AS num_queries, SUM({cnt}) AS cnt_total, \
             SUM({sum}) AS sum_total, MIN({min}) AS min_value, MAX({max}) AS max_value \
             FROM {METRICS_TABLE}{filter} GROUP BY {dim} \
             ORDER BY sum_total DESC, dimension ASC LIMIT {limit} OFFSET {offset}",
            nq = columns::NUM_QUERIES,
            cnt = columns::M_CNT,
            sum = columns::M_SUM,
            min = columns::M_MIN,
            max = columns::M_MAX,
            filter = self.filter(),
            limit = self.limit,
            offset = self.offset,
        )
    }

    /// Build the query counting all groups, ignoring limit and offset.
    pub fn build_total(&self) -> String {
        format!(
            "SELECT COUNT(DISTINCT {dim}) AS total FROM {METRICS_TABLE}{filter}",
            dim = self.group_by.column(),
            filter = self.filter(),
        )
    }
}

/// Every metric for one value of a dimension (usually one fingerprint).
///
/// Result columns: `metric_name, num_queries, cnt_total, sum_total, min_value, max_value`.
#[derive(Debug, Clone)]
#[must_use = "builders do nothing until .build() is called"]
pub struct ObjectDetailsQueryBuilder {
    dimension: Dimension,
    value: String,
    period: PeriodRange,
    labels: LabelFilter,
}

impl ObjectDetailsQueryBuilder {
    pub fn new(dimension: Dimension, value: impl Into<String>) -> Self {
        Self {
            dimension,
            value: value.into(),
            period: PeriodRange::default(),
            labels: LabelFilter::default(),
        }
    }

    pub const fn period(mut self, period: PeriodRange) -> Self {
        self.period = period;
        self
    }

    pub fn labels(mut self, labels: LabelFilter) -> Self {
        self.labels = labels;
        self
    }

    pub fn build(&self) -> String {
        format!(
            "SELECT {metric} AS metric_name, SUM({nq}) AS num_queries, SUM({cnt}) AS cnt_total, \
             SUM({sum}) AS sum_total, MIN({min}) AS min_value, MAX({max}) AS max_value \
             FROM {METRICS_TABLE} WHERE {dim} = '{value}'{period}{labels} \
             GROUP BY {metric} ORDER BY {metric}",
            metric = columns::METRIC,
            nq = columns::NUM_QUERIES,
            cnt = columns::M_CNT,
            sum = columns::M_SUM,
            min = columns::M_MIN,
            max = columns::M_MAX,
            dim = self.dimension.column(),
            value = escape_string(&self.value),
            period = self.period.predicates(),
            labels = self.labels.predicates(),
        )
    }
}

/// Distinct values of one label with the number of queries seen for each.
///
/// Result columns: `label_value, num_queries`.
#[derive(Debug, Clone)]
#[must_use = "builders do nothing until .build() is called"]
pub struct FiltersQueryBuilder {
    dimension: Dimension,
    main_metric: String,
    period: PeriodRange,
    labels: LabelFilter,
}

impl FiltersQueryBuilder {
    pub fn new(dimension: Dimension, main_metric: impl Into<String>) -> Self {
        Self {
            dimension,
            main_metric: main_metric.into(),
            period: PeriodRange::default(),
            labels: LabelFilter::default(),
        }
    }

    pub const fn period(mut self, period: PeriodRange) -> Self {
        self.period = period;
        self
    }

    pub fn labels(mut self, labels: LabelFilter) -> Self {
        self.labels = labels;
        self
    }

    pub fn build(&self) -> String {
        // num_queries is repeated on every metric row of a bucket, so count
        // through a single metric to avoid multiplying it
        format!(
            "SELECT {dim} AS label_value, SUM({nq}) AS num_queries FROM {METRICS_TABLE} \
             WHERE {metric} = '{main}'{period}{labels} \
             GROUP BY {dim} ORDER BY num_queries DESC, label_value ASC",
            dim = self.dimension.column(),
            nq = columns::NUM_QUERIES,
            metric = columns::METRIC,
            main = escape_string(&self.main_metric),
            period = self.period.predicates(),
            labels = self.labels.predicates(),
        )
    }
}

/// Names of every metric ever persisted.
#[derive(Debug, Clone, Default)]
#[must_use = "builders do nothing until .build() is called"]
pub struct MetricsNamesQueryBuilder;

impl MetricsNamesQueryBuilder {
    pub const fn new() -> Self {
        Self
    }

    pub fn build(&self) -> String {
        format!(
            "SELECT DISTINCT {metric} AS metric_name FROM {METRICS_TABLE} ORDER BY metric_name",
            metric = columns::METRIC
        )
    }
}

/// Escape a string for use in a SQL string literal.
///
/// Single quotes are doubled and null bytes removed.
fn escape_string(s: &str) -> String {
    s.chars()
        .filter(|&c| c != '\0')
        .flat_map(|c| match c {
            '\'' => vec!['\'', '\''],
            _ => vec![c],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_query_basic() {
        let sql = ReportQueryBuilder::new(Dimension::Fingerprint, "query_time")
            .limit(5)
            .offset(10)
            .build();

        assert!(sql.contains("SELECT fingerprint AS dimension"));
        assert!(sql.contains("WHERE metric = 'query_time'"));
        assert!(sql.contains("GROUP BY fingerprint"));
        assert!(sql.contains("LIMIT 5 OFFSET 10"));
    }

    #[test]
    fn report_limit_defaults_and_clamps() {
        let report = ReportQueryBuilder::new(Dimension::Database, "query_time").limit(0);
        assert_eq!(report.effective_limit(), DEFAULT_REPORT_LIMIT);

        let report = report.limit(1_000_000);
        assert_eq!(report.effective_limit(), MAX_REPORT_LIMIT);
    }

    #[test]
    fn period_adds_partition_predicates() {
        // [2024-01-01T00:00:00Z, 2024-01-03T00:00:00Z)
        let sql = ReportQueryBuilder::new(Dimension::Fingerprint, "query_time")
            .period(PeriodRange::new(1_704_067_200, 1_704_240_000))
            .build();

        assert!(sql.contains("period_start >= 1704067200"));
        assert!(sql.contains("period_start < 1704240000"));
        assert!(sql.contains("date >= '2024-01-01'"));
        // exclusive end at midnight stays on the previous day
        assert!(sql.contains("date <= '2024-01-02'"));
    }

    #[test]
    fn unbounded_period_has_no_predicates() {
        let sql = ObjectDetailsQueryBuilder::new(Dimension::Fingerprint, "abc").build();
        assert!(!sql.contains("period_start"));
        assert!(!sql.contains("date"));
    }

    #[test]
    fn empty_period_rejected() {
        assert!(PeriodRange::new(100, 100).validate().is_err());
        assert!(PeriodRange::new(0, 100).validate().is_ok());
    }

    #[test]
    fn labels_become_in_lists() {
        let values = vec!["shop".to_owned(), "billing".to_owned()];
        let labels = LabelFilter::from_pairs([("database", values.as_slice())]).unwrap();
        let sql = FiltersQueryBuilder::new(Dimension::ServiceName, "query_time")
            .labels(labels)
            .build();

        assert!(sql.contains("AND database IN ('shop', 'billing')"));
        assert!(sql.contains("GROUP BY service_name"));
    }

    #[test]
    fn unknown_label_rejected() {
        let values = vec!["x".to_owned()];
        let result = LabelFilter::from_pairs([("password", values.as_slice())]);
        assert!(matches!(result, Err(QanError::InvalidArgument(_))));
    }

    #[test]
    fn dimension_names_roundtrip() {
        for dim in Dimension::ALL {
            assert_eq!(Dimension::parse(dim.name()).unwrap(), dim);
        }
        assert!(Dimension::parse("fingerprint; DROP TABLE metrics").is_err());
    }

    #[test]
    fn escape_string_prevents_injection() {
        let sql =
            ObjectDetailsQueryBuilder::new(Dimension::Fingerprint, "x'; DROP TABLE metrics; --")
                .build();

        assert!(sql.contains("x''; DROP TABLE metrics; --"));
        assert!(!sql.contains("x'; DROP"));
    }

    #[test]
    fn escape_string_removes_null_bytes() {
        assert_eq!(escape_string("test\0injection"), "testinjection");
    }

    #[test]
    fn metrics_names_query() {
        let sql = MetricsNamesQueryBuilder::new().build();
        assert_eq!(
            sql,
            "SELECT DISTINCT metric AS metric_name FROM metrics ORDER BY metric_name"
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn escape_string_never_leaves_unescaped_quotes(s in ".*") {
                let escaped = escape_string(&s);
                let quote_count = escaped.matches('\'').count();
                prop_assert!(quote_count % 2 == 0, "unescaped quote in: {}", escaped);
            }
        }
    }
}
