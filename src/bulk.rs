//! Batch generation and deletion driven by `z/x/y` coordinate lists.
//!
//! Input is read to completion before the first mutation. A stream that fails
//! part-way produces an error and touches nothing. Once mutation starts, items
//! are independent: a failed item is reported and the batch carries on.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, instrument, warn};

use crate::error::{KilnError, Result};
use crate::generator::TileGenerator;
use crate::storage::TileStore;
use crate::tile::{TileCoordinate, TileRange};
use crate::tileset::TilesetConfig;

#[derive(Debug)]
pub enum ItemOutcome {
    Generated { bytes: usize },
    Deleted,
    Failed(KilnError),
}

impl ItemOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, ItemOutcome::Failed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Generated { .. } => "generated",
            ItemOutcome::Deleted => "deleted",
            ItemOutcome::Failed(_) => "failed",
        }
    }
}

/// Result for one input line. `line` is 1-based.
#[derive(Debug)]
pub struct ItemReport {
    pub line: usize,
    pub input: String,
    pub coordinate: Option<TileCoordinate>,
    pub outcome: ItemOutcome,
}

/// Per-item results, parallel to the input list.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub items: Vec<ItemReport>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|i| i.outcome.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemReport> {
        self.items.iter().filter(|i| !i.outcome.is_success())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Failures a zoom-range summary keeps in full. Later ones are only counted.
pub const MAX_REPORTED_FAILURES: usize = 1000;

/// Outcome of a zoom-range generation. A range can hold far more tiles than is
/// reasonable to report one by one, so only counts plus the first
/// [`MAX_REPORTED_FAILURES`] failures are kept.
#[derive(Debug, Default)]
pub struct RangeSummary {
    pub tiles: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub failures: Vec<ItemReport>,
}

impl RangeSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Failures counted but not kept in `failures`.
    pub fn unreported(&self) -> u64 {
        self.failed - self.failures.len() as u64
    }
}

/// One buffered, non-blank input line and the coordinate it names.
#[derive(Debug)]
pub struct InputLine {
    /// 1-based position among the non-blank lines.
    pub line: usize,
    pub input: String,
    pub coordinate: Result<TileCoordinate>,
}

impl InputLine {
    fn parse(line: usize, input: String) -> Self {
        let coordinate = input.parse::<TileCoordinate>();
        Self {
            line,
            input,
            coordinate,
        }
    }

    fn from_bytes(line: usize, raw: Vec<u8>) -> Self {
        match String::from_utf8(raw) {
            Ok(text) => Self::parse(line, text),
            Err(e) => Self {
                line,
                input: String::from_utf8_lossy(e.as_bytes()).into_owned(),
                coordinate: Err(KilnError::Validation(format!(
                    "line {line} is not valid UTF-8"
                ))),
            },
        }
    }
}

fn input_lines(lines: Vec<String>) -> Vec<InputLine> {
    lines
        .into_iter()
        .enumerate()
        .map(|(i, input)| InputLine::parse(i + 1, input))
        .collect()
}

/// Read every non-blank line from `reader`. A read error fails the whole read;
/// a line that is not UTF-8 becomes a failed item.
pub async fn read_lines<R>(reader: R) -> Result<Vec<InputLine>>
where
    R: AsyncBufRead + Unpin,
{
    let mut segments = reader.split(b'\n');
    let mut out = Vec::new();
    while let Some(mut raw) = segments.next_segment().await? {
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        out.push(InputLine::from_bytes(out.len() + 1, raw));
    }
    Ok(out)
}

pub struct BulkRunner {
    generator: TileGenerator,
    store: Arc<dyn TileStore>,
    concurrency: usize,
}

impl BulkRunner {
    pub fn new(generator: TileGenerator, store: Arc<dyn TileStore>, concurrency: usize) -> Self {
        Self {
            generator,
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Read coordinates from `reader`, then generate and store each tile.
    pub async fn generate_from<R>(
        &self,
        config: &TilesetConfig,
        reader: R,
        layers: Option<&[String]>,
    ) -> Result<BatchReport>
    where
        R: AsyncBufRead + Unpin,
    {
        if let Some(names) = layers {
            config.check_layer_names(names)?;
        }
        let lines = read_lines(reader).await?;
        self.generate_inputs(config, lines, layers).await
    }

    /// Read coordinates from `reader`, then delete each tile.
    pub async fn delete_from<R>(&self, tileset_id: &str, reader: R) -> Result<BatchReport>
    where
        R: AsyncBufRead + Unpin,
    {
        delete_from(self.store.as_ref(), tileset_id, reader, self.concurrency).await
    }

    /// Generate and store the tile for each line, in input order.
    pub async fn generate_batch(
        &self,
        config: &TilesetConfig,
        lines: Vec<String>,
        layers: Option<&[String]>,
    ) -> Result<BatchReport> {
        self.generate_inputs(config, input_lines(lines), layers).await
    }

    #[instrument(skip(self, config, lines, layers), fields(tileset = %config.id, items = lines.len()))]
    async fn generate_inputs(
        &self,
        config: &TilesetConfig,
        lines: Vec<InputLine>,
        layers: Option<&[String]>,
    ) -> Result<BatchReport> {
        if let Some(names) = layers {
            config.check_layer_names(names)?;
        }
        let items: Vec<ItemReport> = futures::stream::iter(lines)
            .map(|item| async move {
                let coordinate = item.coordinate.as_ref().ok().copied();
                let outcome = match item.coordinate {
                    Ok(c) => self.generate_one(config, c, layers).await,
                    Err(e) => ItemOutcome::Failed(e),
                };
                record("generate", &outcome);
                ItemReport {
                    line: item.line,
                    input: item.input,
                    coordinate,
                    outcome,
                }
            })
            .buffered(self.concurrency)
            .collect()
            .await;
        let report = BatchReport { items };
        info!(
            succeeded = report.succeeded(),
            failed = report.items.len() - report.succeeded(),
            "bulk generation finished"
        );
        Ok(report)
    }

    /// Generate and store every tile from `minzoom` through `maxzoom`.
    #[instrument(skip(self, config, layers), fields(tileset = %config.id))]
    pub async fn generate_zooms(
        &self,
        config: &TilesetConfig,
        minzoom: u8,
        maxzoom: u8,
        layers: Option<&[String]>,
    ) -> Result<RangeSummary> {
        if let Some(names) = layers {
            config.check_layer_names(names)?;
        }
        let range = TileRange::new(minzoom, maxzoom)?;
        let tiles = range.len();
        info!(tiles, minzoom, maxzoom, "generating zoom range");

        let mut summary = RangeSummary {
            tiles,
            ..RangeSummary::default()
        };
        let mut results = std::pin::pin!(futures::stream::iter(range)
            .map(|c| async move { (c, self.generate_one(config, c, layers).await) })
            .buffered(self.concurrency));
        let mut line = 0usize;
        while let Some((coordinate, outcome)) = results.next().await {
            line += 1;
            record("generate", &outcome);
            if outcome.is_success() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
                if summary.failures.len() >= MAX_REPORTED_FAILURES {
                    continue;
                }
                summary.failures.push(ItemReport {
                    line,
                    input: coordinate.to_string(),
                    coordinate: Some(coordinate),
                    outcome,
                });
            }
        }
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "zoom range generation finished"
        );
        Ok(summary)
    }

    async fn generate_one(
        &self,
        config: &TilesetConfig,
        coordinate: TileCoordinate,
        layers: Option<&[String]>,
    ) -> ItemOutcome {
        let rendered = match self
            .generator
            .generate_layers(config, coordinate, layers)
            .await
        {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(tile = %coordinate, error = %e, "generation failed");
                return ItemOutcome::Failed(e);
            }
        };
        let bytes = rendered.payload.len();
        match self.store.put(&config.id, coordinate, rendered.payload).await {
            Ok(()) => ItemOutcome::Generated { bytes },
            Err(e) => {
                warn!(tile = %coordinate, error = %e, "store failed");
                ItemOutcome::Failed(e)
            }
        }
    }
}

/// Read coordinates from `reader`, then delete each tile from `store`.
///
/// Deletion needs no source database, so it is usable without a generator.
pub async fn delete_from<R>(
    store: &dyn TileStore,
    tileset_id: &str,
    reader: R,
    concurrency: usize,
) -> Result<BatchReport>
where
    R: AsyncBufRead + Unpin,
{
    let lines = read_lines(reader).await?;
    Ok(delete_inputs(store, tileset_id, lines, concurrency).await)
}

/// Delete the tile for each line, in input order.
pub async fn delete_batch(
    store: &dyn TileStore,
    tileset_id: &str,
    lines: Vec<String>,
    concurrency: usize,
) -> BatchReport {
    delete_inputs(store, tileset_id, input_lines(lines), concurrency).await
}

#[instrument(skip(store, lines), fields(items = lines.len()))]
async fn delete_inputs(
    store: &dyn TileStore,
    tileset_id: &str,
    lines: Vec<InputLine>,
    concurrency: usize,
) -> BatchReport {
    let items: Vec<ItemReport> = futures::stream::iter(lines)
        .map(|item| async move {
            let coordinate = item.coordinate.as_ref().ok().copied();
            let outcome = match item.coordinate {
                Ok(c) => match store.delete(tileset_id, c).await {
                    Ok(()) => ItemOutcome::Deleted,
                    Err(e) => ItemOutcome::Failed(e),
                },
                Err(e) => ItemOutcome::Failed(e),
            };
            record("delete", &outcome);
            ItemReport {
                line: item.line,
                input: item.input,
                coordinate,
                outcome,
            }
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;
    let report = BatchReport { items };
    info!(
        succeeded = report.succeeded(),
        failed = report.items.len() - report.succeeded(),
        "bulk deletion finished"
    );
    report
}

fn record(operation: &str, outcome: &ItemOutcome) {
    crate::metrics::BULK_ITEMS_TOTAL
        .with_label_values(&[operation, outcome.label()])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::tests::StubSource;
    use crate::storage::ObjectTileStore;
    use crate::tileset::tests::config_from;
    use bytes::Bytes;
    use object_store::memory::InMemory;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, BufReader, ReadBuf};

    /// Yields `data`, then fails every later read.
    struct FailAfter {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for FailAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pos < self.data.len() {
                let n = buf.remaining().min(self.data.len() - self.pos);
                let start = self.pos;
                buf.put_slice(&self.data[start..start + n]);
                self.pos += n;
                Poll::Ready(Ok(()))
            } else {
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "input closed",
                )))
            }
        }
    }

    const YAML: &str = r#"
metadata: {id: osm}
vector_layers:
  water:
    sql:
      - {minzoom: 0, maxzoom: 4, file: q.sql}
  roads:
    sql:
      - {minzoom: 2, maxzoom: 4, file: q.sql}
"#;

    fn config() -> TilesetConfig {
        config_from(YAML, &[("q.sql", "SELECT 1")]).unwrap()
    }

    fn tile(z: u32, x: u32, y: u32) -> TileCoordinate {
        TileCoordinate::new(z, x, y).unwrap()
    }

    async fn runner(source: Arc<StubSource>) -> (BulkRunner, Arc<dyn TileStore>) {
        let store: Arc<dyn TileStore> = Arc::new(ObjectTileStore::new(Arc::new(InMemory::new())));
        store.init_tileset(&config()).await.unwrap();
        let generator = TileGenerator::new(source, None);
        (BulkRunner::new(generator, store.clone(), 3), store)
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_delete_with_failed_input_deletes_nothing() {
        let (runner, store) = runner(Arc::new(StubSource::default())).await;
        let tiles = [
            tile(1, 0, 0),
            tile(1, 1, 0),
            tile(2, 0, 0),
            tile(2, 1, 1),
            tile(3, 4, 4),
        ];
        for t in tiles {
            store.put("osm", t, Bytes::from_static(b"x")).await.unwrap();
        }

        // Three of five coordinates arrive, then the stream breaks.
        let reader = BufReader::new(FailAfter {
            data: b"1/0/0\n1/1/0\n2/0/0\n".to_vec(),
            pos: 0,
        });
        let err = runner.delete_from("osm", reader).await.unwrap_err();
        assert!(matches!(err, KilnError::Io(_)));

        for t in tiles {
            assert!(store.exists("osm", t).await.unwrap(), "{t} was deleted");
        }
    }

    #[tokio::test]
    async fn test_delete_batch_reports_per_item() {
        let (runner, store) = runner(Arc::new(StubSource::default())).await;
        store
            .put("osm", tile(2, 1, 1), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let reader = BufReader::new(&b"2/1/1\nnot/a/tile\n\n3/9/0\n2/0/0\n"[..]);
        let report = runner.delete_from("osm", reader).await.unwrap();
        assert_eq!(report.items.len(), 4);
        assert_eq!(report.succeeded(), 2);
        assert!(!report.is_success());

        let failed: Vec<_> = report.failures().map(|i| i.input.as_str()).collect();
        assert_eq!(failed, vec!["not/a/tile", "3/9/0"]);
        assert!(!store.exists("osm", tile(2, 1, 1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_batch_from_buffered_lines() {
        let (_runner, store) = runner(Arc::new(StubSource::default())).await;
        store
            .put("osm", tile(3, 2, 2), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let report = delete_batch(store.as_ref(), "osm", lines(&["3/2/2", "3/8/0"]), 2).await;
        let outcomes: Vec<bool> = report.items.iter().map(|i| i.outcome.is_success()).collect();
        assert_eq!(outcomes, vec![true, false]);
        assert_eq!(report.items[1].line, 2);
        assert!(!store.exists("osm", tile(3, 2, 2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_generate_batch_stores_tiles_in_order() {
        let source = Arc::new(StubSource::default());
        let (runner, store) = runner(source.clone()).await;
        let report = runner
            .generate_batch(&config(), lines(&["0/0/0", "2/1/1", "3/0/0"]), None)
            .await
            .unwrap();
        assert!(report.is_success());
        let order: Vec<_> = report.items.iter().map(|i| i.line).collect();
        assert_eq!(order, vec![1, 2, 3]);

        let z0 = store.get("osm", tile(0, 0, 0)).await.unwrap().unwrap();
        assert_eq!(&z0.payload[..], b"<water>");
        let z2 = store.get("osm", tile(2, 1, 1)).await.unwrap().unwrap();
        assert_eq!(&z2.payload[..], b"<water><roads>");
        assert_eq!(source.calls(), 5);
    }

    #[tokio::test]
    async fn test_generate_batch_continues_past_failures() {
        let source = Arc::new(StubSource {
            failing: ["roads".to_string()].into(),
            ..Default::default()
        });
        let (runner, store) = runner(source).await;
        let report = runner
            .generate_batch(&config(), lines(&["1/0/0", "2/0/0", "9/0/0/0", "1/1/1"]), None)
            .await
            .unwrap();

        let outcomes: Vec<bool> = report.items.iter().map(|i| i.outcome.is_success()).collect();
        assert_eq!(outcomes, vec![true, false, false, true]);
        assert!(matches!(
            report.items[1].outcome,
            ItemOutcome::Failed(KilnError::Generation { .. })
        ));
        assert!(store.exists("osm", tile(1, 1, 1)).await.unwrap());
        assert!(!store.exists("osm", tile(2, 0, 0)).await.unwrap());
    }

    #[tokio::test]
    async fn test_generate_rejects_unknown_layer_up_front() {
        let source = Arc::new(StubSource::default());
        let (runner, _store) = runner(source.clone()).await;
        let only = vec!["lakes".to_string()];
        let err = runner
            .generate_batch(&config(), lines(&["1/0/0"]), Some(&only))
            .await
            .unwrap_err();
        assert!(matches!(err, KilnError::UnknownLayer { .. }));
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_generate_zooms() {
        let source = Arc::new(StubSource::default());
        let (runner, store) = runner(source).await;
        let summary = runner.generate_zooms(&config(), 0, 2, None).await.unwrap();
        assert_eq!(summary.tiles, 21);
        assert_eq!(summary.succeeded, 21);
        assert!(summary.is_success());

        let stats = store.zoom_stats("osm").await.unwrap();
        let counts: Vec<_> = stats.iter().map(|s| (s.zoom, s.tiles)).collect();
        assert_eq!(counts, vec![(0, 1), (1, 4), (2, 16)]);
    }

    #[tokio::test]
    async fn test_store_failure_is_per_item() {
        let source = Arc::new(StubSource::default());
        let store: Arc<dyn TileStore> = Arc::new(ObjectTileStore::new(Arc::new(InMemory::new())));
        // Never initialized: every put fails.
        let runner = BulkRunner::new(TileGenerator::new(source, None), store, 2);
        let report = runner
            .generate_batch(&config(), lines(&["0/0/0", "1/0/0"]), None)
            .await
            .unwrap();
        assert_eq!(report.succeeded(), 0);
        assert_eq!(report.items.len(), 2);
    }
}
