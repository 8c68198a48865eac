use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libchannel_engine::cache::{CacheKey, CacheManager, Decoded};
use libchannel_engine::channel::{
    ChannelSummary, Dataset, SourceKind, Statistics, StatisticsAccumulator,
};
use libchannel_engine::codec::{epoch_millis_to_ticks, now_epoch_millis};
use libchannel_engine::config::EngineConfig;
use libchannel_engine::engine::ChannelEngine;
use libchannel_engine::error::{CacheError, ChannelError, EngineError};
use libchannel_engine::progressive::ProgressiveReader;
use libchannel_engine::resample::ChannelWindow;
use libchannel_engine::scope_file::{write_scope_file, ScopeHeader};

fn decoded(source: SourceKind) -> Decoded {
    Decoded::from(Dataset::new(source, 0))
}

async fn fill(cache: &CacheManager, key: &CacheKey) {
    let source = key.source;
    cache
        .get_or_decode(key.clone(), move || async move { Ok::<_, String>(decoded(source)) })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expiry() {
    let cache = CacheManager::new(Duration::from_secs(60), 4);
    let key = CacheKey::new(SourceKind::Scope, "exp_01");
    fill(&cache, &key).await;

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(cache.get(&key).is_some());

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.get(&key).is_none());
    assert_eq!(cache.stats().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_purge_expired() {
    let cache = CacheManager::new(Duration::from_secs(10), 4);
    fill(&cache, &CacheKey::new(SourceKind::Scope, "old")).await;
    tokio::time::advance(Duration::from_secs(8)).await;
    fill(&cache, &CacheKey::new(SourceKind::Scope, "new")).await;
    tokio::time::advance(Duration::from_secs(5)).await;

    assert_eq!(cache.purge_expired(), 1);
    assert!(cache.get(&CacheKey::new(SourceKind::Scope, "new")).is_some());
}

#[tokio::test]
async fn test_capacity_evicts_oldest_of_the_same_source() {
    let cache = CacheManager::new(Duration::from_secs(600), 2);
    let a = CacheKey::new(SourceKind::Temperature, "a");
    let b = CacheKey::new(SourceKind::Temperature, "b");
    let c = CacheKey::new(SourceKind::Temperature, "c");
    let other = CacheKey::new(SourceKind::Position, "a");
    fill(&cache, &other).await;
    fill(&cache, &a).await;
    fill(&cache, &b).await;
    fill(&cache, &c).await;

    assert!(cache.get(&a).is_none());
    assert!(cache.get(&b).is_some());
    assert!(cache.get(&c).is_some());
    assert!(cache.get(&other).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_decode() {
    let cache = CacheManager::new(Duration::from_secs(600), 4);
    let key = CacheKey::new(SourceKind::Acceleration, "exp_01");
    let decodes = Arc::new(AtomicUsize::new(0));

    let decode = |counter: Arc<AtomicUsize>| {
        move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, String>(decoded(SourceKind::Acceleration))
        }
    };
    let (first, second) = tokio::join!(
        cache.get_or_decode(key.clone(), decode(decodes.clone())),
        cache.get_or_decode(key.clone(), decode(decodes.clone())),
    );

    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    assert!(Arc::ptr_eq(&first.unwrap(), &second.unwrap()));
}

#[tokio::test(start_paused = true)]
async fn test_failure_reaches_every_waiter_then_retries() {
    let cache = CacheManager::new(Duration::from_secs(600), 4);
    let key = CacheKey::new(SourceKind::Position, "exp_01");
    let decodes = Arc::new(AtomicUsize::new(0));

    let failing = |counter: Arc<AtomicUsize>| {
        move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err::<Decoded, _>(String::from("unreadable file"))
        }
    };
    let (first, second) = tokio::join!(
        cache.get_or_decode(key.clone(), failing(decodes.clone())),
        cache.get_or_decode(key.clone(), failing(decodes.clone())),
    );
    let expected = CacheError::DecodeInFlightFailed(String::from("unreadable file"));
    assert_eq!(first.unwrap_err(), expected);
    assert_eq!(second.unwrap_err(), expected);
    assert_eq!(decodes.load(Ordering::SeqCst), 1);
    assert_eq!(cache.stats().pending, 0);

    fill(&cache, &key).await;
    assert!(cache.get(&key).is_some());
}

#[tokio::test]
async fn test_panicking_decode_releases_placeholder() {
    let cache = CacheManager::new(Duration::from_secs(600), 4);
    let key = CacheKey::new(SourceKind::Scope, "exp_01");
    let result = cache
        .get_or_decode(key.clone(), || async {
            if true {
                panic!("decoder bug");
            }
            Ok::<_, String>(decoded(SourceKind::Scope))
        })
        .await;
    assert!(matches!(result, Err(CacheError::DecodeInFlightFailed(_))));
    assert_eq!(cache.stats().pending, 0);

    fill(&cache, &key).await;
    assert!(cache.get(&key).is_some());
}

#[derive(Debug)]
struct FlagReader {
    closed: Arc<AtomicBool>,
}

impl ProgressiveReader for FlagReader {
    fn list_channels(&self) -> Vec<ChannelSummary> {
        Vec::new()
    }

    fn attributes(&self, id: &str) -> Result<BTreeMap<String, String>, ChannelError> {
        Err(ChannelError::NotFound(id.to_string()))
    }

    fn fetch_window(
        &self,
        _id: &str,
        _start: f64,
        _end: f64,
        _max_points: usize,
    ) -> Result<ChannelWindow, ChannelError> {
        Ok(ChannelWindow::empty())
    }

    fn statistics(&self, id: &str) -> Result<Statistics, ChannelError> {
        Err(ChannelError::NotFound(id.to_string()))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_invalidate_closes_reader() {
    let cache = CacheManager::new(Duration::from_secs(600), 4);
    let key = CacheKey::new(SourceKind::Chunked, "exp_01");
    let closed = Arc::new(AtomicBool::new(false));
    let flag = closed.clone();
    let entry = cache
        .get_or_decode(key.clone(), move || async move {
            Ok::<_, String>(Decoded {
                dataset: Dataset::new(SourceKind::Chunked, 0),
                reader: Some(Box::new(FlagReader { closed: flag })),
            })
        })
        .await
        .unwrap();
    assert!(cache.stats().items[0].progressive);
    assert!(!closed.load(Ordering::SeqCst));

    assert!(cache.invalidate(&key));
    assert!(closed.load(Ordering::SeqCst));
    assert!(entry.reader.as_ref().is_some_and(|reader| reader.is_closed()));
}

// Ramp of `len` samples at 1 Hz that only answers in chunks
#[derive(Debug)]
struct RampReader {
    len: usize,
    window_fetches: AtomicUsize,
}

impl ProgressiveReader for RampReader {
    fn list_channels(&self) -> Vec<ChannelSummary> {
        Vec::new()
    }

    fn attributes(&self, id: &str) -> Result<BTreeMap<String, String>, ChannelError> {
        Err(ChannelError::NotFound(id.to_string()))
    }

    fn fetch_window(
        &self,
        _id: &str,
        _start: f64,
        _end: f64,
        _max_points: usize,
    ) -> Result<ChannelWindow, ChannelError> {
        self.window_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(ChannelWindow::empty())
    }

    fn statistics(&self, id: &str) -> Result<Statistics, ChannelError> {
        if id != "ramp" {
            return Err(ChannelError::NotFound(id.to_string()));
        }
        let mut accumulator = StatisticsAccumulator::default();
        let values: Vec<f64> = (0..self.len).map(|i| i as f64).collect();
        for chunk in values.chunks(100) {
            accumulator.extend(chunk);
        }
        Ok(accumulator.finish((self.len - 1) as f64))
    }

    fn close(&self) {}

    fn is_closed(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn test_progressive_statistics_come_from_reader() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_for(dir.path());
    let reader = Arc::new(RampReader {
        len: 1001,
        window_fetches: AtomicUsize::new(0),
    });
    let shared = reader.clone();
    engine
        .cache()
        .get_or_decode(CacheKey::new(SourceKind::Chunked, "exp_01"), move || async move {
            Ok::<_, String>(Decoded {
                dataset: Dataset::new(SourceKind::Chunked, 0),
                reader: Some(Box::new(SharedReader(shared))),
            })
        })
        .await
        .unwrap();

    let stats = engine
        .statistics("exp_01", SourceKind::Chunked, "ramp")
        .await
        .unwrap();
    assert_eq!(stats.count, 1001);
    assert_eq!(stats.max, 1000.0);
    assert!((stats.mean - 500.0).abs() < 1e-9);
    assert_eq!(stats.duration_seconds, 1000.0);
    assert_eq!(reader.window_fetches.load(Ordering::SeqCst), 0);
    assert!(matches!(
        engine.statistics("exp_01", SourceKind::Chunked, "other").await,
        Err(EngineError::Channel(ChannelError::NotFound(_)))
    ));
}

// Lets a test keep a handle on a reader owned by the cache
#[derive(Debug)]
struct SharedReader(Arc<RampReader>);

impl ProgressiveReader for SharedReader {
    fn list_channels(&self) -> Vec<ChannelSummary> {
        self.0.list_channels()
    }

    fn attributes(&self, id: &str) -> Result<BTreeMap<String, String>, ChannelError> {
        self.0.attributes(id)
    }

    fn fetch_window(
        &self,
        id: &str,
        start: f64,
        end: f64,
        max_points: usize,
    ) -> Result<ChannelWindow, ChannelError> {
        self.0.fetch_window(id, start, end, max_points)
    }

    fn statistics(&self, id: &str) -> Result<Statistics, ChannelError> {
        self.0.statistics(id)
    }

    fn close(&self) {
        self.0.close()
    }

    fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

// Experiment fixture: a scope dump, a temperature log with epoch time that started 2 s
// before the scope, and a position log with relative time.
fn write_experiment(data_path: &Path, master_ms: i64) {
    let experiment = data_path.join("exp_01");
    std::fs::create_dir(&experiment).unwrap();

    let header = ScopeHeader {
        description: String::from("Bench run"),
        buffer_size: 100,
        start_ticks: epoch_millis_to_ticks(master_ms),
        max_adc_value: 32512,
        channel_range: [5000; 8],
        channel_scaling: [1; 8],
        sampling_interval_ns: 1_000_000,
        downsampling: [1; 8],
        units: vec![String::from("V"); 8],
        labels: (0..8).map(|c| format!("Probe {c}")).collect(),
    };
    let samples: Vec<Vec<i16>> = (0..8)
        .map(|c| (0..100).map(|i| (i * (c + 1)) as i16).collect())
        .collect();
    std::fs::write(experiment.join("scope.bin"), write_scope_file(&header, &samples)).unwrap();

    let temperature: String = (0..10)
        .map(|i| format!("{},{}\n", master_ms - 2000 + i * 1000, 20.0 + i as f64 * 0.5))
        .collect();
    std::fs::write(experiment.join("temperature.csv"), temperature).unwrap();

    let position: String = (0..5).map(|i| format!("{}\t{}\n", i * 1000, i)).collect();
    std::fs::write(experiment.join("position.csv"), position).unwrap();
}

fn engine_for(data_path: &Path) -> ChannelEngine {
    ChannelEngine::from_config(EngineConfig {
        data_path: data_path.to_path_buf(),
        zero_offset_sources: vec![SourceKind::Position],
        ..Default::default()
    })
}

#[tokio::test]
async fn test_engine_channels_and_windows() {
    let dir = tempfile::tempdir().unwrap();
    write_experiment(dir.path(), now_epoch_millis() - 3_600_000);
    let engine = engine_for(dir.path());

    let channels = engine.list_channels("exp_01", SourceKind::Scope).await.unwrap();
    assert_eq!(channels.len(), 15);
    assert!(channels.iter().all(|summary| summary.points == 100));

    let window = engine
        .channel_window("exp_01", SourceKind::Scope, "raw_0", f64::NAN, f64::NAN, 10)
        .await
        .unwrap();
    assert!(window.len() <= 10);

    let bulk = engine
        .bulk_channel_window("exp_01", SourceKind::Temperature, &["temperature_t1", "nope"], 0.0, 3000.0, 100)
        .await
        .unwrap();
    assert_eq!(bulk["temperature_t1"].as_ref().unwrap().len(), 4);
    assert_eq!(bulk["nope"], Err(ChannelError::NotFound(String::from("nope"))));

    let stats = engine
        .statistics("exp_01", SourceKind::Temperature, "temperature_t1")
        .await
        .unwrap();
    assert_eq!(stats.count, 10);
    assert_eq!(stats.min, 20.0);
    assert_eq!(stats.max, 24.5);
    assert_eq!(stats.duration_seconds, 9.0);

    assert!(matches!(
        engine.magnitude_window("exp_01", 0.0, 1.0, 10).await,
        Err(EngineError::Resolve(_))
    ));
    assert!(matches!(
        engine.list_channels("exp_02", SourceKind::Scope).await,
        Err(EngineError::Resolve(_))
    ));

    assert_eq!(engine.cache_stats().entries, 2);
    assert!(engine.invalidate("exp_01", SourceKind::Scope));
    assert_eq!(engine.invalidate_all(SourceKind::Temperature), 1);
    assert_eq!(engine.cache_stats().entries, 0);
}

#[tokio::test]
async fn test_engine_alignment() {
    let dir = tempfile::tempdir().unwrap();
    let master_ms = now_epoch_millis() - 3_600_000;
    write_experiment(dir.path(), master_ms);
    let engine = engine_for(dir.path());

    let record = engine.align_experiment("exp_01", false).await.unwrap();
    assert_eq!(record.master_start_absolute_ms, master_ms);
    assert_eq!(record.offset(SourceKind::Temperature), Some(2.0));
    assert_eq!(record.offset(SourceKind::Position), Some(0.0));
    assert!(!record.offsets.contains_key(&SourceKind::Acceleration));
    assert!(dir.path().join("exp_01").join("alignment.yml").exists());

    // Master time 0..3000 ms is local 2000..5000 ms of the temperature log
    let window = engine
        .aligned_channel_window("exp_01", SourceKind::Temperature, "temperature_t1", 0.0, 3000.0, 100)
        .await
        .unwrap();
    assert_eq!(window.time, vec![0.0, 1000.0, 2000.0, 3000.0]);
    assert_eq!(window.values, vec![21.0, 21.5, 22.0, 22.5]);

    // A bad id in a batch fails only its own slot
    let bulk = engine
        .bulk_aligned_channel_window("exp_01", SourceKind::Temperature, &["temperature_t1", "nope"], 0.0, 3000.0, 100)
        .await
        .unwrap();
    assert_eq!(bulk["temperature_t1"].as_ref().unwrap().values, window.values);
    assert_eq!(bulk["nope"], Err(ChannelError::NotFound(String::from("nope"))));

    let record = engine
        .set_manual_offset("exp_01", SourceKind::Temperature, Some(1.0))
        .await
        .unwrap();
    assert_eq!(record.offset(SourceKind::Temperature), Some(1.0));

    let record = engine.align_experiment("exp_01", true).await.unwrap();
    assert_eq!(record.offset(SourceKind::Temperature), Some(1.0));
    assert!(record.offsets[&SourceKind::Temperature].manual);

    // A fresh engine picks the stored record up from disk
    let reloaded = engine_for(dir.path())
        .align_experiment("exp_01", false)
        .await
        .unwrap();
    assert_eq!(reloaded, record);
}

#[tokio::test]
async fn test_alignment_needs_master() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("exp_01")).unwrap();
    std::fs::write(dir.path().join("exp_01").join("position.csv"), "0\t1\n1000\t2\n").unwrap();
    let engine = engine_for(dir.path());
    assert!(matches!(
        engine.align_experiment("exp_01", false).await,
        Err(EngineError::Alignment(_))
    ));
}
