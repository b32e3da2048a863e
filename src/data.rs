use crate::error::{FetchError, Result};
use crate::remote::{ColumnFilter, PageRange, RemoteStore, TableQuery};
use crate::types::{self, BoundingBox, Feature, FeatureCollection, Row, GEOMETRY_COLUMN};
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Rows per request; also the store's default response cap.
pub const PAGE_SIZE: usize = 1000;

pub const COMUNA_COLUMN: &str = "comuna";

/// Comunas making up the Gran Concepción metropolitan area.
pub const GRAN_CONCEPCION: [&str; 9] = [
    "CONCEPCIÓN",
    "TALCAHUANO",
    "HUALPÉN",
    "CHIGUAYANTE",
    "SAN PEDRO DE LA PAZ",
    "PENCO",
    "TOMÉ",
    "CORONEL",
    "LOTA",
];

/// Server-side scope of a filtered fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Comuna(String),
    Comunas(Vec<String>),
    Bounds(BoundingBox),
}

impl Filter {
    pub fn gran_concepcion() -> Self {
        Filter::Comunas(GRAN_CONCEPCION.iter().map(|c| c.to_string()).collect())
    }
}

/// How faithfully a fetch honoured its filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchScope {
    /// Exactly the requested rows.
    Filtered,
    /// The spatial filter was unavailable; every row was returned instead.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct Fetched {
    pub collection: FeatureCollection,
    pub scope: FetchScope,
}

impl Fetched {
    pub fn is_degraded(&self) -> bool {
        self.scope == FetchScope::Degraded
    }
}

/// Per-comuna totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComunaStats {
    pub total_population: i64,
    pub total_male: i64,
    pub total_female: i64,
    pub total_viviendas: i64,
    pub manzanas: usize,
}

/// What one paginated read walks through.
#[derive(Clone, Copy)]
enum PageSource<'a> {
    Table(&'a TableQuery),
    Bounds(&'a BoundingBox),
}

/// Fetches census blocks from a [`RemoteStore`], one page at a time.
///
/// No caching: every call goes back to the store.
pub struct Fetcher<S> {
    store: S,
    page_size: usize,
}

impl<S: RemoteStore> Fetcher<S> {
    pub fn new(store: S) -> Self {
        Self::with_page_size(store, PAGE_SIZE)
    }

    pub fn with_page_size(store: S, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Every row in the table.
    pub async fn fetch_all(&self) -> Result<FeatureCollection> {
        info!("Fetching all manzanas from database...");
        let rows = self.paginate(PageSource::Table(&TableQuery::all()), "manzanas").await?;
        info!("Loaded all {} manzanas", rows.len());
        Ok(to_feature_collection(rows))
    }

    /// Rows matching `filter`. A missing spatial procedure widens the
    /// result to the full table and marks it [`FetchScope::Degraded`].
    pub async fn fetch_by_filter(&self, filter: &Filter) -> Result<Fetched> {
        match filter {
            Filter::Comuna(name) => {
                let query = TableQuery::all().filtered(ColumnFilter::Eq {
                    column: COMUNA_COLUMN.to_string(),
                    value: name.clone(),
                });
                let rows = self.paginate(PageSource::Table(&query), name).await?;
                info!("Loaded {} manzanas from {}", rows.len(), name);
                Ok(filtered(rows))
            }
            Filter::Comunas(names) => {
                let query = TableQuery::all().filtered(ColumnFilter::In {
                    column: COMUNA_COLUMN.to_string(),
                    values: names.clone(),
                });
                let rows = self.paginate(PageSource::Table(&query), "selected comunas").await?;
                info!("Loaded {} manzanas from {} comunas", rows.len(), names.len());
                Ok(filtered(rows))
            }
            Filter::Bounds(bounds) => self.fetch_in_bounds(bounds).await,
        }
    }

    pub async fn fetch_by_comuna(&self, name: &str) -> Result<FeatureCollection> {
        let fetched = self.fetch_by_filter(&Filter::Comuna(name.to_string())).await?;
        Ok(fetched.collection)
    }

    pub async fn fetch_gran_concepcion(&self) -> Result<FeatureCollection> {
        let fetched = self.fetch_by_filter(&Filter::gran_concepcion()).await?;
        Ok(fetched.collection)
    }

    /// Rows inside `bounds`, paged like every table read.
    pub async fn fetch_in_bounds(&self, bounds: &BoundingBox) -> Result<Fetched> {
        match self.paginate(PageSource::Bounds(bounds), "manzanas in bounds").await {
            Ok(rows) => {
                info!("Loaded {} manzanas in bounds", rows.len());
                Ok(filtered(rows))
            }
            Err(FetchError::UnsupportedOperation(reason)) => {
                warn!(
                    "Spatial filter unavailable ({}); falling back to the full table",
                    reason
                );
                Ok(Fetched {
                    collection: self.fetch_all().await?,
                    scope: FetchScope::Degraded,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Distinct comuna names, in the store's ascending order.
    pub async fn list_comunas(&self) -> Result<Vec<String>> {
        let query = TableQuery::columns(&[COMUNA_COLUMN]).ordered_by(COMUNA_COLUMN);
        let rows = self.paginate(PageSource::Table(&query), "comunas").await?;
        let mut comunas: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get(COMUNA_COLUMN).and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect();
        comunas.dedup();
        Ok(comunas)
    }

    pub async fn comuna_stats(&self, name: &str) -> Result<ComunaStats> {
        let query = TableQuery::columns(&["n_per", "n_hombres", "n_mujeres", "n_vp"]).filtered(
            ColumnFilter::Eq {
                column: COMUNA_COLUMN.to_string(),
                value: name.to_string(),
            },
        );
        let rows = self.paginate(PageSource::Table(&query), name).await?;
        Ok(comuna_stats_from_rows(&rows))
    }

    /// Requests pages in order until one comes back short. A final page of
    /// exactly `page_size` rows costs one extra, empty request.
    async fn paginate(&self, source: PageSource<'_>, label: &str) -> Result<Vec<Row>> {
        let mut all_rows = Vec::new();
        let mut page = 0;
        loop {
            let range = PageRange::page(page, self.page_size);
            let result = match source {
                PageSource::Table(query) => self.store.select(query, range).await,
                PageSource::Bounds(bounds) => self.store.rows_in_bounds(bounds, range).await,
            };
            let rows = result.map_err(|e| {
                if !matches!(e, FetchError::UnsupportedOperation(_)) {
                    error!(
                        "Error fetching {} (rows {}-{}): {}",
                        label,
                        range.offset,
                        range.last(),
                        e
                    );
                }
                e
            })?;
            let has_more = rows.len() == self.page_size;
            all_rows.extend(rows);
            page += 1;
            if !has_more {
                break;
            }
            info!("Loaded {} {} so far...", all_rows.len(), label);
        }
        debug!("{} finished after {} requests", label, page);
        Ok(all_rows)
    }
}

fn filtered(rows: Vec<Row>) -> Fetched {
    Fetched {
        collection: to_feature_collection(rows),
        scope: FetchScope::Filtered,
    }
}

/// Splits each row into its geometry column and the remaining properties.
pub fn to_feature_collection<I>(rows: I) -> FeatureCollection
where
    I: IntoIterator<Item = Row>,
{
    let features = rows
        .into_iter()
        .map(|mut row| {
            let geometry = row.remove(GEOMETRY_COLUMN).unwrap_or_default();
            Feature::new(geometry, row)
        })
        .collect();
    FeatureCollection::new(features)
}

pub fn comuna_stats_from_rows(rows: &[Row]) -> ComunaStats {
    let sum = |field: &str| -> i64 {
        rows.iter()
            .map(|row| types::number(row, field).round() as i64)
            .sum()
    };
    ComunaStats {
        total_population: sum("n_per"),
        total_male: sum("n_hombres"),
        total_female: sum("n_mujeres"),
        total_viviendas: sum("n_vp"),
        manzanas: rows.len(),
    }
}

/// Monotonic ticket identifying one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket(u64);

/// Holds the current collection and rejects results from superseded fetches.
#[derive(Debug, Default)]
pub struct CollectionSlot {
    started: u64,
    collection: FeatureCollection,
}

impl CollectionSlot {
    pub fn begin(&mut self) -> FetchTicket {
        self.started += 1;
        FetchTicket(self.started)
    }

    /// Replaces the collection wholesale if `ticket` is the latest fetch.
    pub fn install(&mut self, ticket: FetchTicket, collection: FeatureCollection) -> bool {
        if ticket.0 != self.started {
            debug!(
                "Discarding stale fetch {} (latest is {})",
                ticket.0, self.started
            );
            return false;
        }
        self.collection = collection;
        true
    }

    pub fn collection(&self) -> &FeatureCollection {
        &self.collection
    }

    pub fn into_collection(self) -> FeatureCollection {
        self.collection
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Table held in memory; records every page request.
    pub(crate) struct MemoryStore {
        rows: Vec<Row>,
        bounds_supported: bool,
        fail_at_offset: Option<usize>,
        pub(crate) requests: Mutex<Vec<PageRange>>,
        bounds_requests: Mutex<Vec<PageRange>>,
    }

    impl MemoryStore {
        pub(crate) fn new(rows: Vec<Row>) -> Self {
            Self {
                rows,
                bounds_supported: true,
                fail_at_offset: None,
                requests: Mutex::new(Vec::new()),
                bounds_requests: Mutex::new(Vec::new()),
            }
        }

        fn without_bounds_rpc(mut self) -> Self {
            self.bounds_supported = false;
            self
        }

        fn failing_at(mut self, offset: usize) -> Self {
            self.fail_at_offset = Some(offset);
            self
        }

        fn ranges(&self) -> Vec<(usize, usize)> {
            spans(&self.requests)
        }

        fn bounds_ranges(&self) -> Vec<(usize, usize)> {
            spans(&self.bounds_requests)
        }
    }

    fn spans(requests: &Mutex<Vec<PageRange>>) -> Vec<(usize, usize)> {
        requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| (r.offset, r.last()))
            .collect()
    }

    fn row_matches(row: &Row, filter: &Option<ColumnFilter>) -> bool {
        let value_of = |column: &str| row.get(column).and_then(Value::as_str).map(str::to_string);
        match filter {
            None => true,
            Some(ColumnFilter::Eq { column, value }) => value_of(column).as_ref() == Some(value),
            Some(ColumnFilter::In { column, values }) => {
                value_of(column).map_or(false, |v| values.contains(&v))
            }
        }
    }

    #[async_trait]
    impl RemoteStore for MemoryStore {
        async fn select(&self, query: &TableQuery, range: PageRange) -> Result<Vec<Row>> {
            self.requests.lock().unwrap().push(range);
            if self.fail_at_offset == Some(range.offset) {
                return Err(FetchError::Remote {
                    status: 500,
                    message: "page failed".into(),
                });
            }
            let mut rows: Vec<Row> = self
                .rows
                .iter()
                .filter(|row| row_matches(row, &query.filter))
                .cloned()
                .collect();
            if let Some(order) = &query.order {
                rows.sort_by(|a, b| {
                    let key = |r: &Row| {
                        r.get(order)
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string()
                    };
                    key(a).cmp(&key(b))
                });
            }
            Ok(rows.into_iter().skip(range.offset).take(range.limit).collect())
        }

        async fn rows_in_bounds(
            &self,
            bounds: &BoundingBox,
            range: PageRange,
        ) -> Result<Vec<Row>> {
            if !self.bounds_supported {
                return Err(FetchError::UnsupportedOperation(
                    "rpc/get_manzanas_in_bounds".into(),
                ));
            }
            self.bounds_requests.lock().unwrap().push(range);
            Ok(self
                .rows
                .iter()
                .filter(|row| {
                    let lng = types::number(row, "lng");
                    let lat = types::number(row, "lat");
                    lng >= bounds.min_lng
                        && lng <= bounds.max_lng
                        && lat >= bounds.min_lat
                        && lat <= bounds.max_lat
                })
                .skip(range.offset)
                .take(range.limit)
                .cloned()
                .collect())
        }
    }

    pub(crate) fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    fn numbered_rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                row(json!({
                    "id": i,
                    "comuna": if i % 2 == 0 { "PENCO" } else { "LOTA" },
                    "geom": {"type": "Point", "coordinates": [i as f64, 0.0]},
                    "n_per": 1
                }))
            })
            .collect()
    }

    #[test]
    fn conversion_splits_geometry_from_properties() {
        let geom = json!({
            "type": "Polygon",
            "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
        });
        let rows = vec![row(json!({"geom": geom.clone(), "comuna": "PENCO", "n_per": 10}))];
        let fc = to_feature_collection(rows);
        assert_eq!(fc.len(), 1);
        let feature = &fc.features[0];
        assert_eq!(feature.geometry, geom);
        assert!(!feature.properties.contains_key("geom"));
        assert_eq!(feature.properties.len(), 2);
        assert_eq!(feature.text("comuna"), Some("PENCO"));
    }

    #[test]
    fn empty_or_null_rows_give_empty_collection() {
        let empty = to_feature_collection(Vec::new());
        assert!(empty.is_empty());
        let from_null = to_feature_collection(None::<Vec<Row>>.into_iter().flatten());
        assert_eq!(
            serde_json::to_value(&from_null).unwrap(),
            json!({"type": "FeatureCollection", "features": []})
        );
    }

    #[test]
    fn row_without_geometry_keeps_null_geometry() {
        let fc = to_feature_collection(vec![row(json!({"n_per": 1}))]);
        assert_eq!(fc.features[0].geometry, Value::Null);
    }

    #[tokio::test]
    async fn fetch_all_pages_through_the_table() {
        let fetcher = Fetcher::new(MemoryStore::new(numbered_rows(2500)));
        let fc = fetcher.fetch_all().await.unwrap();
        assert_eq!(fc.len(), 2500);
        assert_eq!(
            fetcher.store().ranges(),
            vec![(0, 999), (1000, 1999), (2000, 2999)]
        );
        let ids: Vec<i64> = fc.features.iter().map(|f| f.count("id")).collect();
        assert_eq!(ids, (0..2500).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn exact_page_multiple_costs_one_empty_request() {
        let fetcher = Fetcher::new(MemoryStore::new(numbered_rows(1000)));
        let fc = fetcher.fetch_all().await.unwrap();
        assert_eq!(fc.len(), 1000);
        assert_eq!(fetcher.store().ranges(), vec![(0, 999), (1000, 1999)]);
    }

    #[tokio::test]
    async fn empty_table_is_one_request() {
        let fetcher = Fetcher::new(MemoryStore::new(Vec::new()));
        assert!(fetcher.fetch_all().await.unwrap().is_empty());
        assert_eq!(fetcher.store().ranges().len(), 1);
    }

    #[tokio::test]
    async fn failed_page_aborts_without_partial_result() {
        let fetcher = Fetcher::new(MemoryStore::new(numbered_rows(2500)).failing_at(1000));
        let err = fetcher.fetch_all().await.unwrap_err();
        assert!(matches!(err, FetchError::Remote { status: 500, .. }));
        assert_eq!(fetcher.store().ranges().len(), 2);
    }

    #[tokio::test]
    async fn fetch_all_is_repeatable() {
        let fetcher = Fetcher::with_page_size(MemoryStore::new(numbered_rows(25)), 10);
        let first = fetcher.fetch_all().await.unwrap();
        let second = fetcher.fetch_all().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn comuna_filter_is_paginated() {
        let fetcher = Fetcher::with_page_size(MemoryStore::new(numbered_rows(30)), 10);
        let fetched = fetcher
            .fetch_by_filter(&Filter::Comuna("PENCO".into()))
            .await
            .unwrap();
        assert_eq!(fetched.scope, FetchScope::Filtered);
        assert_eq!(fetched.collection.len(), 15);
        assert!(fetched
            .collection
            .features
            .iter()
            .all(|f| f.text("comuna") == Some("PENCO")));
        assert_eq!(fetcher.store().ranges().len(), 2);
    }

    #[tokio::test]
    async fn gran_concepcion_uses_in_filter() {
        let mut rows = numbered_rows(4);
        rows.push(row(json!({"comuna": "SANTIAGO", "n_per": 5})));
        let fetcher = Fetcher::new(MemoryStore::new(rows));
        let fc = fetcher.fetch_gran_concepcion().await.unwrap();
        assert_eq!(fc.len(), 4);
    }

    #[tokio::test]
    async fn bounds_filter_uses_rpc_when_available() {
        let rows = vec![
            row(json!({"lng": -73.05, "lat": -36.82, "n_per": 1})),
            row(json!({"lng": -70.0, "lat": -33.0, "n_per": 1})),
        ];
        let fetcher = Fetcher::new(MemoryStore::new(rows));
        let bounds = BoundingBox::new(-73.2, -37.0, -72.9, -36.7);
        let fetched = fetcher.fetch_by_filter(&Filter::Bounds(bounds)).await.unwrap();
        assert!(!fetched.is_degraded());
        assert_eq!(fetched.collection.len(), 1);
        assert!(fetcher.store().ranges().is_empty());
        assert_eq!(fetcher.store().bounds_ranges(), vec![(0, 999)]);
    }

    #[tokio::test]
    async fn bounds_filter_pages_past_the_response_cap() {
        let rows: Vec<Row> = (0..2500)
            .map(|i| row(json!({"id": i, "lng": -73.05, "lat": -36.82, "n_per": 1})))
            .collect();
        let fetcher = Fetcher::new(MemoryStore::new(rows));
        let bounds = BoundingBox::new(-73.2, -37.0, -72.9, -36.7);
        let fetched = fetcher.fetch_in_bounds(&bounds).await.unwrap();
        assert!(!fetched.is_degraded());
        assert_eq!(fetched.collection.len(), 2500);
        assert_eq!(
            fetcher.store().bounds_ranges(),
            vec![(0, 999), (1000, 1999), (2000, 2999)]
        );
        let ids: Vec<i64> = fetched
            .collection
            .features
            .iter()
            .map(|f| f.count("id"))
            .collect();
        assert_eq!(ids, (0..2500).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn missing_bounds_rpc_degrades_to_full_fetch() {
        let rows = vec![
            row(json!({"lng": -73.05, "lat": -36.82, "n_per": 1})),
            row(json!({"lng": -70.0, "lat": -33.0, "n_per": 1})),
        ];
        let fetcher = Fetcher::new(MemoryStore::new(rows).without_bounds_rpc());
        let bounds = BoundingBox::new(-73.2, -37.0, -72.9, -36.7);
        let fetched = fetcher.fetch_in_bounds(&bounds).await.unwrap();
        assert!(fetched.is_degraded());
        assert_eq!(fetched.collection.len(), 2);
    }

    #[tokio::test]
    async fn comunas_are_distinct_and_sorted() {
        let fetcher = Fetcher::with_page_size(MemoryStore::new(numbered_rows(7)), 3);
        let comunas = fetcher.list_comunas().await.unwrap();
        assert_eq!(comunas, vec!["LOTA".to_string(), "PENCO".to_string()]);
    }

    #[tokio::test]
    async fn comuna_stats_sum_fields() {
        let rows = vec![
            row(json!({"comuna": "TOMÉ", "n_per": 10, "n_hombres": 4, "n_mujeres": 6, "n_vp": 3})),
            row(json!({"comuna": "TOMÉ", "n_per": 5, "n_hombres": null, "n_mujeres": 5})),
            row(json!({"comuna": "LOTA", "n_per": 100})),
        ];
        let fetcher = Fetcher::new(MemoryStore::new(rows));
        let stats = fetcher.comuna_stats("TOMÉ").await.unwrap();
        assert_eq!(
            stats,
            ComunaStats {
                total_population: 15,
                total_male: 4,
                total_female: 11,
                total_viviendas: 3,
                manzanas: 2,
            }
        );
    }

    #[test]
    fn stale_fetch_results_are_discarded() {
        let mut slot = CollectionSlot::default();
        let old = slot.begin();
        let new = slot.begin();
        let fresh = to_feature_collection(numbered_rows(2));
        assert!(slot.install(new, fresh.clone()));
        assert!(!slot.install(old, to_feature_collection(numbered_rows(5))));
        assert_eq!(slot.collection(), &fresh);
    }
}
