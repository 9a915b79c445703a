//! End-to-end behaviour of the stage workers against in-memory collaborators.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio_util::sync::CancellationToken;

use rawmon::SchedulingError;
use rawmon::domain::{SampleStatus, Stage};
use rawmon::pipeline::{
    ConvertSettings, ConvertStage, Outcome, PoolState, ScheduleStage, StageHandler, UploadStage,
    WorkerPool, WorkerPoolConfig,
};
use rawmon::queue::QueueService;
use rawmon::watch::StabilityProbe;
use rawmon::Error;

use common::*;

const METHOD: &str = "csh | 6530 | test | positive";

fn fast_probe() -> StabilityProbe {
    StabilityProbe::new(Duration::from_millis(50))
}

fn pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        size: 1,
        lease_timeout: Duration::from_secs(60),
        idle_backoff: Duration::from_millis(10),
    }
}

mod conversion_tests {
    use super::*;

    struct Fixture {
        stage: ConvertStage,
        queue: Arc<rawmon::queue::MemoryQueue>,
        handles: std::collections::HashMap<Stage, rawmon::queue::QueueHandle>,
        tracker: Arc<RecordingTracker>,
        converter: Arc<FakeConverter>,
        out: tempfile::TempDir,
    }

    async fn fixture(
        tracker: RecordingTracker,
        storage: MemoryStorage,
        configure: impl FnOnce(ConvertSettings) -> ConvertSettings,
    ) -> Fixture {
        let (queue, handles) = memory_queues().await;
        let out = tempfile::tempdir().expect("Failed to create output dir");
        let settings = ConvertSettings::new(out.path(), fast_probe())
            .with_skip_patterns(&[r"[\\/]DNU[\\/]"])
            .expect("Failed to compile skip pattern");
        let tracker = Arc::new(tracker);
        let converter = Arc::new(FakeConverter::default());
        let stage = ConvertStage::new(
            configure(settings),
            tracker.clone(),
            Arc::new(storage),
            converter.clone(),
            queue.clone(),
            handles[&Stage::Upload].clone(),
        );
        Fixture {
            stage,
            queue,
            handles,
            tracker,
            converter,
            out,
        }
    }

    fn write_bundle(root: &Path) -> std::path::PathBuf {
        let bundle = root.join("monitored.d");
        std::fs::create_dir_all(bundle.join("AcqData")).unwrap();
        std::fs::write(bundle.join("AcqData/MSScan.bin"), vec![0u8; 2048]).unwrap();
        std::fs::write(bundle.join("AcqData/MSPeak.bin"), vec![0u8; 512]).unwrap();
        std::fs::write(bundle.join("desktop.ini"), b"[.ShellClassInfo]").unwrap();
        bundle
    }

    #[tokio::test]
    async fn test_stable_bundle_is_converted_and_forwarded() {
        let raw = tempfile::tempdir().unwrap();
        let bundle = write_bundle(raw.path());
        let f = fixture(RecordingTracker::default(), MemoryStorage::default(), |s| s).await;

        let outcome = f.stage.handle(&bundle.to_string_lossy()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);

        let updates = f.tracker.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].status, SampleStatus::Acquired);
        assert_eq!(updates[0].sample, "monitored");
        assert_eq!(updates[0].file_handle.as_deref(), Some("monitored.d"));
        assert_eq!(updates[1].status, SampleStatus::Converted);
        assert_eq!(updates[1].file_handle.as_deref(), Some("monitored.mzml"));

        let calls = f.converter.calls.lock().clone();
        assert_eq!(calls, vec![(bundle.clone(), f.out.path().join("autoconv"))]);

        let forwarded = drain(f.queue.as_ref(), &f.handles[&Stage::Upload]).await;
        let expected = f.out.path().join("autoconv").join("monitored.mzml");
        assert_eq!(forwarded, vec![expected.to_string_lossy().into_owned()]);
    }

    #[tokio::test]
    async fn test_dnu_path_is_skipped_without_state() {
        let f = fixture(RecordingTracker::default(), MemoryStorage::default(), |s| s).await;

        let outcome = f
            .stage
            .handle("/data/instrument/DNU/B1_MX1_posCSH.raw")
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert!(f.tracker.updates().is_empty());
        assert!(f.converter.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_converted_input_goes_straight_to_upload() {
        let raw = tempfile::tempdir().unwrap();
        let mzml = raw.path().join("already.mzml");
        std::fs::write(&mzml, b"<mzML/>").unwrap();
        let f = fixture(RecordingTracker::default(), MemoryStorage::default(), |s| s).await;

        let outcome = f.stage.handle(&mzml.to_string_lossy()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(f.tracker.updates().is_empty());
        assert!(f.converter.calls.lock().is_empty());
        assert_eq!(
            drain(f.queue.as_ref(), &f.handles[&Stage::Upload]).await,
            vec![mzml.to_string_lossy().into_owned()]
        );
    }

    #[tokio::test]
    async fn test_project_id_selects_output_folder() {
        let raw = tempfile::tempdir().unwrap();
        let file = raw.path().join("MX123456_B1_posCSH.raw");
        std::fs::write(&file, b"raw").unwrap();
        let f = fixture(RecordingTracker::default(), MemoryStorage::default(), |s| s).await;

        f.stage.handle(&file.to_string_lossy()).await.unwrap();
        let calls = f.converter.calls.lock().clone();
        assert_eq!(calls[0].1, f.out.path().join("mx123456"));
    }

    #[tokio::test]
    async fn test_unknown_sample_skipped_when_existence_checked() {
        let raw = tempfile::tempdir().unwrap();
        let file = raw.path().join("stranger.raw");
        std::fs::write(&file, b"raw").unwrap();
        let f = fixture(RecordingTracker::default(), MemoryStorage::default(), |mut s| {
            s.check_exists = true;
            s
        })
        .await;

        let outcome = f.stage.handle(&file.to_string_lossy()).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert!(f.tracker.updates().is_empty());
    }

    #[tokio::test]
    async fn test_recent_archive_copy_skips_reconversion() {
        let raw = tempfile::tempdir().unwrap();
        let file = raw.path().join("repeat.raw");
        std::fs::write(&file, b"raw").unwrap();
        let storage = MemoryStorage::default().with_object("repeat.mzml", Utc::now());
        let f = fixture(RecordingTracker::default(), storage, |mut s| {
            s.freshness_window = Some(chrono::Duration::hours(24));
            s
        })
        .await;

        let outcome = f.stage.handle(&file.to_string_lossy()).await.unwrap();
        assert!(matches!(outcome, Outcome::Skipped(_)));
        assert!(f.converter.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_conversion_failure_reports_tool_output() {
        let raw = tempfile::tempdir().unwrap();
        let file = raw.path().join("broken.wiff");
        std::fs::write(&file, b"raw").unwrap();
        let (queue, handles) = memory_queues().await;
        let tracker = Arc::new(RecordingTracker::default());
        let converter = Arc::new(FakeConverter {
            fail_with: Some("Error: unsupported vendor format".to_string()),
            ..FakeConverter::default()
        });
        let stage = ConvertStage::new(
            ConvertSettings::new(raw.path().join("out"), fast_probe()),
            tracker.clone(),
            Arc::new(MemoryStorage::default()),
            converter,
            queue.clone(),
            handles[&Stage::Upload].clone(),
        );

        let outcome = stage.handle(&file.to_string_lossy()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed("Error: unsupported vendor format".to_string())
        );
        assert_eq!(tracker.statuses("broken"), vec![SampleStatus::Acquired]);
        assert_eq!(queue.size(&handles[&Stage::Upload]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_item_does_not_stop_the_pool() {
        let raw = tempfile::tempdir().unwrap();
        let good = raw.path().join("good.raw");
        std::fs::write(&good, b"raw").unwrap();
        let f = fixture(RecordingTracker::default(), MemoryStorage::default(), |s| s).await;
        let conversion = f.handles[&Stage::Conversion].clone();

        // The first path does not exist, so measuring it fails.
        f.queue
            .enqueue(&conversion, &raw.path().join("missing.raw").to_string_lossy())
            .await
            .unwrap();
        f.queue
            .enqueue(&conversion, &good.to_string_lossy())
            .await
            .unwrap();

        let tracker = f.tracker.clone();
        let root = CancellationToken::new();
        let pool = WorkerPool::new("conversion", pool_config(), &root);
        pool.start(f.queue.clone(), conversion.clone(), Arc::new(f.stage), tracker.clone());

        eventually("both items handled", || {
            tracker.statuses("good").contains(&SampleStatus::Converted)
                && !tracker.failures().is_empty()
        })
        .await;
        assert_eq!(pool.state(), PoolState::Running);

        pool.stop();
        assert!(pool.join(Duration::from_secs(5)).await);

        let failures = tracker.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].sample, "missing");
        assert!(failures[0].reason.as_deref().unwrap().contains("missing.raw"));

        let forwarded = drain(f.queue.as_ref(), &f.handles[&Stage::Upload]).await;
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded[0].ends_with("good.mzml"));
        assert_eq!(f.queue.size(&conversion).await.unwrap(), 0);
    }
}

mod upload_tests {
    use super::*;

    fn converted_file(dir: &Path, name: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"<mzML/>").unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_marks_uploaded_and_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let file = converted_file(dir.path(), "B1_MX1_posCSH.mzml");
        let (queue, handles) = memory_queues().await;
        let storage = Arc::new(MemoryStorage::default());
        let tracker = Arc::new(RecordingTracker::default());
        let stage = UploadStage::new(
            storage.clone(),
            tracker.clone(),
            queue.clone(),
            Some(handles[&Stage::Schedule].clone()),
        )
        .with_host("acq-pc-7");

        let outcome = stage.handle(&file.to_string_lossy()).await.unwrap();
        assert_eq!(outcome, Outcome::Done);
        assert!(storage.contains("B1_MX1_posCSH.mzml"));
        assert!(!file.exists(), "local copy should be removed");

        let updates = tracker.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, SampleStatus::UploadedRaw);
        assert_eq!(updates[0].file_handle.as_deref(), Some("B1_MX1_posCSH.mzml"));
        assert_eq!(
            updates[0].reason.as_deref(),
            Some("File uploaded by Monitor running on acq-pc-7")
        );

        assert_eq!(
            drain(queue.as_ref(), &handles[&Stage::Schedule]).await,
            vec!["B1_MX1_posCSH".to_string()]
        );
    }

    #[tokio::test]
    async fn test_replayed_upload_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let file = converted_file(dir.path(), "replayed.mzml");
        let payload = file.to_string_lossy().into_owned();
        let (queue, _) = memory_queues().await;
        let storage = Arc::new(MemoryStorage::default());
        let tracker = Arc::new(RecordingTracker::default());
        let stage = UploadStage::new(storage.clone(), tracker.clone(), queue, None);

        assert_eq!(stage.handle(&payload).await.unwrap(), Outcome::Done);
        assert_eq!(stage.handle(&payload).await.unwrap(), Outcome::Done);

        assert_eq!(*storage.saves.lock(), 1);
        assert!(tracker.failures().is_empty());
        assert_eq!(
            tracker.statuses("replayed"),
            vec![SampleStatus::UploadedRaw, SampleStatus::UploadedRaw]
        );
    }

    #[tokio::test]
    async fn test_unverified_upload_fails_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let file = converted_file(dir.path(), "lost.mzml");
        let (queue, handles) = memory_queues().await;
        let storage = Arc::new(MemoryStorage {
            lose_uploads: true,
            ..MemoryStorage::default()
        });
        let tracker = Arc::new(RecordingTracker::default());
        let stage = UploadStage::new(
            storage,
            tracker.clone(),
            queue.clone(),
            Some(handles[&Stage::Schedule].clone()),
        );

        let outcome = stage.handle(&file.to_string_lossy()).await.unwrap();
        match outcome {
            Outcome::Failed(reason) => {
                assert!(reason.contains("lost.mzml"));
                assert!(reason.contains("was not found in memory"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!file.exists());
        assert!(tracker.updates().is_empty());
        assert_eq!(queue.size(&handles[&Stage::Schedule]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refused_upload_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = converted_file(dir.path(), "refused.mzml");
        let (queue, _) = memory_queues().await;
        let storage = Arc::new(MemoryStorage {
            refuse_uploads: true,
            ..MemoryStorage::default()
        });
        let stage = UploadStage::new(storage, Arc::new(RecordingTracker::default()), queue, None);

        let outcome = stage.handle(&file.to_string_lossy()).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed("some unknown error happened while uploading the file".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_local_file_never_archived_fails() {
        let (queue, _) = memory_queues().await;
        let stage = UploadStage::new(
            Arc::new(MemoryStorage::default()),
            Arc::new(RecordingTracker::default()),
            queue,
            None,
        );

        let outcome = stage.handle("/nowhere/ghost.mzml").await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(reason) if reason.contains("never archived")));
    }
}

mod schedule_tests {
    use super::*;

    fn day(d: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, 12, 0, 0).unwrap()
    }

    fn stage(
        tracker: RecordingTracker,
        metadata: FakeMetadata,
        jobs: Arc<FakeJobStore>,
    ) -> ScheduleStage {
        ScheduleStage::new(Arc::new(tracker), Arc::new(metadata), jobs)
    }

    #[tokio::test]
    async fn test_job_is_built_stored_and_scheduled() {
        let jobs = Arc::new(FakeJobStore::default());
        let s = stage(
            RecordingTracker::default().with_acquisition("B1_MX1_posCSH", "csh", "6530"),
            FakeMetadata::default()
                .with_version(METHOD, "v1", day(1))
                .with_version(METHOD, "v2", day(3))
                .with_profiles(METHOD, "v2", &["carrot", "lcms"]),
            jobs.clone(),
        );

        let response = s.schedule_sample("B1_MX1_posCSH").await.unwrap();
        assert_eq!(response.job, "preprocess_B1_MX1_posCSH");

        let stored = jobs.jobs.lock().get("preprocess_B1_MX1_posCSH").cloned().unwrap();
        assert_eq!(stored.method, METHOD);
        assert_eq!(stored.profile, "carrot,lcms");
        assert_eq!(stored.samples, vec!["B1_MX1_posCSH".to_string()]);
        assert_eq!(
            jobs.scheduled.lock().clone(),
            vec!["preprocess_B1_MX1_posCSH".to_string()]
        );
    }

    #[tokio::test]
    async fn test_no_versions_uses_fixed() {
        let jobs = Arc::new(FakeJobStore::default());
        let s = stage(
            RecordingTracker::default().with_acquisition("s1", "csh", "6530"),
            FakeMetadata::default().with_profiles(METHOD, "fixed", &["lcms"]),
            jobs.clone(),
        );
        s.schedule_sample("s1").await.unwrap();
        assert_eq!(jobs.jobs.lock()["preprocess_s1"].profile, "lcms");
    }

    #[tokio::test]
    async fn test_version_tie_prefers_first_listed() {
        let jobs = Arc::new(FakeJobStore::default());
        let s = stage(
            RecordingTracker::default().with_acquisition("s1", "csh", "6530"),
            FakeMetadata::default()
                .with_version(METHOD, "alpha", day(2))
                .with_version(METHOD, "beta", day(2))
                .with_profiles(METHOD, "alpha", &["from-alpha"])
                .with_profiles(METHOD, "beta", &["from-beta"]),
            jobs.clone(),
        );

        for _ in 0..3 {
            s.schedule_sample("s1").await.unwrap();
            assert_eq!(jobs.jobs.lock()["preprocess_s1"].profile, "from-alpha");
        }
    }

    #[tokio::test]
    async fn test_scheduling_twice_overwrites_one_job() {
        let jobs = Arc::new(FakeJobStore::default());
        let s = stage(
            RecordingTracker::default().with_acquisition("s1", "csh", "6530"),
            FakeMetadata::default().with_profiles(METHOD, "fixed", &["lcms"]),
            jobs.clone(),
        );
        s.schedule_sample("s1").await.unwrap();
        s.schedule_sample("s1").await.unwrap();
        assert_eq!(jobs.jobs.lock().len(), 1);
        assert_eq!(jobs.scheduled.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_sample() {
        let s = stage(
            RecordingTracker::default(),
            FakeMetadata::default(),
            Arc::new(FakeJobStore::default()),
        );
        let err = s.schedule_sample("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Scheduling(SchedulingError::SampleNotFound(ref s)) if s == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_rejected_job_names_job_id() {
        let s = stage(
            RecordingTracker::default().with_acquisition("s1", "csh", "6530"),
            FakeMetadata::default().with_profiles(METHOD, "fixed", &["lcms"]),
            Arc::new(FakeJobStore::rejecting()),
        );
        let err = s.schedule_sample("s1").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Scheduling(SchedulingError::JobDataStore(ref id)) if id == "preprocess_s1"
        ));
    }

    #[tokio::test]
    async fn test_missing_profile_marks_failed_with_method_and_version() {
        let (queue, handles) = memory_queues().await;
        let schedule = handles[&Stage::Schedule].clone();
        let tracker = Arc::new(RecordingTracker::default().with_acquisition("s1", "csh", "6530"));
        let metadata = Arc::new(FakeMetadata::default().with_version(METHOD, "v9", day(4)));
        let jobs = Arc::new(FakeJobStore::default());
        let handler = Arc::new(ScheduleStage::new(tracker.clone(), metadata, jobs.clone()));

        queue.enqueue(&schedule, "s1").await.unwrap();
        let root = CancellationToken::new();
        let pool = WorkerPool::new("schedule", pool_config(), &root);
        pool.start(queue.clone(), schedule.clone(), handler, tracker.clone());

        eventually("failure reported", || !tracker.failures().is_empty()).await;
        root.cancel();
        assert!(pool.join(Duration::from_secs(5)).await);

        let failures = tracker.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].sample, "s1");
        let reason = failures[0].reason.clone().unwrap();
        assert!(reason.contains(METHOD), "{reason}");
        assert!(reason.contains("v9"), "{reason}");
        assert!(jobs.jobs.lock().is_empty());
        assert_eq!(queue.size(&schedule).await.unwrap(), 0);
    }
}
