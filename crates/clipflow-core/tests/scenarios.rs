use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use clipflow_core::{
    ActiveSession, ArtifactFetcher, DownstreamClient, Error, ErrorKind, GenerationInput,
    GenerationProvider, GenerationRequest, JobStatus, LocalArtifactSink, MemorySessionStore,
    Orchestrator, PersistConfig, PollConfig, PollingEngine, PreSubmitRequest, Result, RetryPolicy,
    SubmissionPipeline, Tag, TagEncoding, TagSet, TaskStatus,
};
use serde_json::Value;

/// Hands out job ids from a fixed list and replays a status script per job.
/// The last scripted status repeats.
struct MockProvider {
    job_ids: Mutex<VecDeque<String>>,
    scripts: Mutex<HashMap<String, VecDeque<JobStatus>>>,
    status_calls: Mutex<usize>,
}

impl MockProvider {
    fn new(jobs: &[(&str, Vec<JobStatus>)]) -> Arc<Self> {
        Arc::new(Self {
            job_ids: Mutex::new(jobs.iter().map(|(id, _)| id.to_string()).collect()),
            scripts: Mutex::new(
                jobs.iter()
                    .map(|(id, steps)| (id.to_string(), steps.clone().into()))
                    .collect(),
            ),
            status_calls: Mutex::new(0),
        })
    }
}

#[async_trait]
impl GenerationProvider for MockProvider {
    async fn submit(&self, _request: &GenerationRequest) -> Result<String> {
        self.job_ids
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::internal("no more job ids"))
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus> {
        *self.status_calls.lock().unwrap() += 1;
        let mut scripts = self.scripts.lock().unwrap();
        let steps = scripts
            .get_mut(job_id)
            .ok_or_else(|| Error::transport("unknown job"))?;
        if steps.len() > 1 {
            Ok(steps.pop_front().unwrap())
        } else {
            Ok(steps.front().cloned().unwrap_or_else(JobStatus::pending))
        }
    }
}

#[derive(Default)]
struct CountingFetcher {
    urls: Mutex<Vec<String>>,
}

#[async_trait]
impl ArtifactFetcher for CountingFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes> {
        self.urls.lock().unwrap().push(url.to_owned());
        Ok(Bytes::from_static(b"\x00\x00\x00\x18ftypmp42"))
    }
}

/// Fails id-encoded payloads as unparseable, accepts name-encoded ones, and
/// fails every request for files listed in `broken`.
#[derive(Default)]
struct PickyDownstream {
    broken: Vec<String>,
    calls: Mutex<Vec<PreSubmitRequest>>,
}

#[async_trait]
impl DownstreamClient for PickyDownstream {
    async fn pre_submit(&self, request: &PreSubmitRequest) -> Result<String> {
        self.calls.lock().unwrap().push(request.clone());
        if self.broken.iter().any(|b| request.file_path.contains(b.as_str())) {
            return Err(Error::Server {
                message: "storage unavailable".into(),
                status: Some(503),
            });
        }
        match request.tag_encoding {
            TagEncoding::Ids => Err(Error::Parsing {
                message: "tags: expected names".into(),
                status: Some(400),
            }),
            TagEncoding::Names => Ok(format!("m-{}", request.file_path)),
        }
    }
}

struct Harness {
    orchestrator: Orchestrator,
    store: MemorySessionStore,
    fetcher: Arc<CountingFetcher>,
    downstream: Arc<PickyDownstream>,
    provider: Arc<MockProvider>,
    _dir: tempfile::TempDir,
}

async fn harness(provider: Arc<MockProvider>, poll: PollConfig, broken: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = MemorySessionStore::new();
    let session = ActiveSession::new(Arc::new(store.clone()), PersistConfig::default());
    session.open_project("product-42").await.unwrap();

    let fetcher = Arc::new(CountingFetcher::default());
    let downstream = Arc::new(PickyDownstream {
        broken: broken.iter().map(|s| s.to_string()).collect(),
        calls: Mutex::new(Vec::new()),
    });
    let poller = PollingEngine::new(
        provider.clone(),
        fetcher.clone(),
        Arc::new(LocalArtifactSink::new(dir.path())),
        poll,
    );
    let submission = SubmissionPipeline::new(downstream.clone(), RetryPolicy::default());
    Harness {
        orchestrator: Orchestrator::new(session, provider.clone(), poller, submission),
        store,
        fetcher,
        downstream,
        provider,
        _dir: dir,
    }
}

fn inputs(names: &[&str]) -> Vec<GenerationInput> {
    names
        .iter()
        .map(|name| GenerationInput {
            image_name: name.to_string(),
            image_url: format!("https://img.example/{name}"),
            prompt: "the model turns and smiles".into(),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn one_job_succeeds_and_one_fails() {
    let provider = MockProvider::new(&[
        (
            "job-a",
            vec![
                JobStatus::pending(),
                JobStatus::pending(),
                JobStatus::succeeded("https://cdn.example/a.mp4"),
            ],
        ),
        (
            "job-b",
            vec![JobStatus::pending(), JobStatus::failed("content policy violation")],
        ),
    ]);
    let h = harness(provider, PollConfig::default(), &[]).await;

    let summary = h
        .orchestrator
        .generate_and_poll(inputs(&["a.png", "b.png"]), Value::Null)
        .await
        .unwrap();

    assert_eq!(summary.requested, 2);
    assert_eq!((summary.completed, summary.failed), (1, 1));
    assert!(!summary.timed_out);

    let session = h.orchestrator.session();
    let a = session.task("job-a").unwrap();
    let b = session.task("job-b").unwrap();
    assert_eq!(a.status, TaskStatus::Downloaded);
    assert!(a.local_path.is_some() && a.relative_path.is_some());
    assert_eq!(b.status, TaskStatus::Failed);
    assert_eq!(b.error.as_deref(), Some("content policy violation"));
    assert_eq!(*h.fetcher.urls.lock().unwrap(), vec!["https://cdn.example/a.mp4"]);

    // Everything reaches the store once the debounce window has passed.
    tokio::time::sleep(Duration::from_secs(2)).await;
    tokio::task::yield_now().await;
    let log = h.store.patch_log().await;
    let last = log.last().unwrap().1.video_tasks.as_ref().unwrap();
    assert_eq!(last[0].status, TaskStatus::Downloaded);
    assert_eq!(last[1].status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn never_terminal_job_hits_the_budget() {
    let provider = MockProvider::new(&[("job-slow", vec![JobStatus::pending()])]);
    let poll = PollConfig {
        interval: Duration::from_secs(3),
        timeout: Duration::from_secs(30),
    };
    let h = harness(provider, poll, &[]).await;

    let started = tokio::time::Instant::now();
    let summary = h
        .orchestrator
        .generate_and_poll(inputs(&["slow.png"]), Value::Null)
        .await
        .unwrap();

    assert!(summary.timed_out);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.pending, vec!["job-slow".to_owned()]);
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() < Duration::from_secs(34));
    assert_eq!(*h.provider.status_calls.lock().unwrap(), 11);
    assert_eq!(
        h.orchestrator.session().task("job-slow").unwrap().status,
        TaskStatus::Processing
    );
}

#[tokio::test(start_paused = true)]
async fn submission_falls_back_to_names_and_isolates_failures() {
    let provider = MockProvider::new(&[
        ("job-1", vec![JobStatus::succeeded("https://cdn.example/1.mp4")]),
        ("job-2", vec![JobStatus::succeeded("https://cdn.example/2.mp4")]),
        ("job-3", vec![JobStatus::succeeded("https://cdn.example/3.mp4")]),
    ]);
    let h = harness(provider, PollConfig::default(), &["job-2"]).await;
    h.orchestrator
        .generate_and_poll(inputs(&["one.png", "two.png", "three.png"]), Value::Null)
        .await
        .unwrap();

    let tags = TagSet::new([Tag::leaf(7, "美食"), Tag::leaf(9, "Vlog")]);
    let report = h
        .orchestrator
        .submit_downloaded("product-42", &tags)
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!((report.succeeded(), report.failed()), (2, 1));
    assert_eq!(report.outcomes[0].attempts, 2);
    let second = report.outcomes[1].result.as_ref().unwrap_err();
    assert_eq!(second.kind(), ErrorKind::Server);
    assert_eq!(report.outcomes[1].attempts, 1);

    let calls = h.downstream.calls.lock().unwrap();
    // Two calls for each recovered task, one for the broken one.
    assert_eq!(calls.len(), 5);
    assert_eq!(calls[0].tags, "7,9");
    assert_eq!(calls[1].tags, "美食,Vlog");

    let session = h.orchestrator.session();
    assert!(session.task("job-1").unwrap().material_id.is_some());
    assert!(session.task("job-2").unwrap().material_id.is_none());
    assert!(session.task("job-3").unwrap().material_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn switching_projects_never_leaks_updates() {
    let provider = MockProvider::new(&[("job-x", vec![JobStatus::pending()])]);
    let h = harness(provider, PollConfig::default(), &[]).await;
    let first = h.orchestrator.session().session_id().unwrap();

    h.orchestrator
        .generate(inputs(&["x.png"]), Value::Null)
        .await
        .unwrap();
    let second = h
        .orchestrator
        .session()
        .open_project("product-43")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;

    assert!(h.store.patch_log().await.is_empty());
    assert!(second.video_tasks.is_empty());
    assert_ne!(first, second.id);
}

#[tokio::test]
async fn download_lands_under_the_session_directory() {
    let provider = MockProvider::new(&[(
        "job-d",
        vec![JobStatus::succeeded("https://cdn.example/out.mp4?token=abc")],
    )]);
    let h = harness(provider, PollConfig::default(), &[]).await;
    h.orchestrator
        .generate_and_poll(inputs(&["portrait.jpg"]), Value::Null)
        .await
        .unwrap();

    let session_id = h.orchestrator.session().session_id().unwrap();
    let task = h.orchestrator.session().task("job-d").unwrap();
    let relative = task.relative_path.unwrap();
    assert_eq!(relative, format!("{session_id}/portrait-job-d.mp4"));
    assert!(Path::new(&task.local_path.unwrap()).exists());
    h.orchestrator.session().flush().await.unwrap();
    assert!(!h.orchestrator.session().has_pending());
}
