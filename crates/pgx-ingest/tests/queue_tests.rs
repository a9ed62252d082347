//! Queue integration tests: ordering, single-runner guarantee, live state

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{Annotator, Harness, Parser, Script};
use pgx_common::{ErrorKind, JobStatus, Stage, SubjectDescriptor};
use pgx_ingest::JobRequest;
use std::time::Duration;

fn single(harness: &Harness, name: &str, owner: &str, lines: usize) -> JobRequest {
    let input = harness.write_input(&format!("{}.vcf", name), lines);
    JobRequest::new(input, owner).with_subject(SubjectDescriptor::new(name, format!("coll_{}", name)))
}

fn slow_script(delay: Duration, lines: u64) -> Script {
    Script {
        annotator: Annotator::Slow(delay),
        parser: Parser::Insert(vec![(lines, 0)]),
        line_count: None,
    }
}

#[tokio::test]
async fn test_back_to_back_jobs_do_not_overlap() {
    let harness = Harness::new();
    harness.tools.set_script(slow_script(Duration::from_millis(100), 10));
    let queue = harness.queue();

    let first = queue.enqueue(single(&harness, "first", "alice", 10)).unwrap();
    let second = queue.enqueue(single(&harness, "second", "alice", 10)).unwrap();

    let first = queue.wait_for(first).await.unwrap();
    let second = queue.wait_for(second).await.unwrap();

    assert_eq!(first.status, JobStatus::Succeeded, "error: {:?}", first.error);
    assert_eq!(second.status, JobStatus::Succeeded, "error: {:?}", second.error);

    let first_cleanup = first
        .timeline
        .iter()
        .find(|m| m.stage == Stage::Cleanup)
        .unwrap()
        .at;
    let second_load = second
        .timeline
        .iter()
        .find(|m| m.stage == Stage::LoadConfiguration)
        .unwrap()
        .at;

    assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
    assert!(second_load >= first_cleanup);
}

#[tokio::test]
async fn test_fifo_with_single_running_job() {
    let harness = Harness::new();
    harness.tools.set_script(slow_script(Duration::from_millis(60), 5));
    let queue = harness.queue();

    let ids: Vec<_> = ["a", "b", "c"]
        .iter()
        .map(|name| queue.enqueue(single(&harness, name, "alice", 5)).unwrap())
        .collect();

    assert_eq!(
        queue.current_jobs().iter().map(|j| j.id).collect::<Vec<_>>(),
        ids
    );

    while !queue.is_empty() {
        let jobs = queue.current_jobs();
        let running = jobs.iter().filter(|j| j.status == JobStatus::Running).count();
        assert!(running <= 1, "{} jobs running at once", running);

        // Whatever is left is a suffix of the submission order
        let remaining: Vec<_> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(remaining, ids[ids.len() - remaining.len()..].to_vec());

        if let Some(head) = jobs.first() {
            assert!(jobs[1..].iter().all(|j| j.status == JobStatus::Queued));
            assert_ne!(head.status, JobStatus::Failed);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    queue.wait_idle().await;
    assert!(!queue.is_running());
    let finished: Vec<_> = queue.finished_jobs().iter().map(|j| j.id).collect();
    assert_eq!(finished, ids);
}

#[tokio::test]
async fn test_current_jobs_reflects_live_progress() {
    let harness = Harness::new();
    harness.tools.set_script(slow_script(Duration::from_millis(300), 4));
    let queue = harness.queue();

    let id = queue.enqueue(single(&harness, "live (copy)", "alice", 4)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = queue.current_jobs();
    let job = snapshot.iter().find(|j| j.id == id).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.started_at.is_some());
    assert_eq!(job.current_stage(), Stage::InvokeAnnotator);
    assert!(job.input_path.ends_with("live_copy.vcf"));

    let done = queue.wait_for(id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded, "error: {:?}", done.error);
}

#[tokio::test]
async fn test_validation_error_starts_nothing() {
    let harness = Harness::new();
    let queue = harness.queue();

    let err = queue
        .enqueue(JobRequest::new(harness.uploads().join("x.vcf"), ""))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(queue.current_jobs().is_empty());
    assert!(!queue.is_running());
    assert!(harness.tools.calls().is_empty());
}

#[tokio::test]
async fn test_pending_subjects_for_owner() {
    let harness = Harness::new();
    harness.tools.set_script(slow_script(Duration::from_millis(200), 3));
    let queue = harness.queue();

    let a = queue.enqueue(single(&harness, "a", "alice", 3)).unwrap();
    queue.enqueue(single(&harness, "b", "bob", 3)).unwrap();
    let c = queue.enqueue(single(&harness, "c", "alice", 3)).unwrap();

    let pending = queue.pending_subjects("alice");
    let ids: Vec<_> = pending.iter().map(|p| p.subject.subject_id.as_str()).collect();
    assert_eq!(ids, vec!["c", "a"]);
    assert_eq!(pending[0].job_id, c);
    assert_eq!(pending[1].job_id, a);
    assert!(pending.iter().all(|p| p.owner == "alice"));

    assert!(queue.is_subject_pending("b"));
    assert!(queue.pending_subjects("carol").is_empty());

    queue.wait_idle().await;
    assert!(queue.pending_subjects("alice").is_empty());
    assert!(!queue.is_subject_pending("b"));
}

#[tokio::test]
async fn test_subscribers_see_every_finished_job() {
    let harness = Harness::new();
    harness.tools.set_script(slow_script(Duration::from_millis(10), 2));
    let queue = harness.queue();
    let mut finished = queue.subscribe();

    let ok = queue.enqueue(single(&harness, "ok", "alice", 2)).unwrap();
    let missing = JobRequest::new(harness.uploads().join("gone.vcf"), "alice")
        .with_subject(SubjectDescriptor::new("gone", "coll_gone"));
    let bad = queue.enqueue(missing).unwrap();

    let first = finished.recv().await.unwrap();
    let second = finished.recv().await.unwrap();

    assert_eq!((first.id, first.status), (ok, JobStatus::Succeeded));
    assert_eq!((second.id, second.status), (bad, JobStatus::Failed));
    assert_eq!(second.error.unwrap().kind(), ErrorKind::Input);
}

#[tokio::test]
async fn test_queue_restarts_after_draining() {
    let harness = Harness::new();
    harness.tools.set_script(slow_script(Duration::ZERO, 2));
    let queue = harness.queue();

    let first = queue.enqueue(single(&harness, "one", "alice", 2)).unwrap();
    queue.wait_idle().await;
    assert_eq!(queue.get(first).unwrap().status, JobStatus::Succeeded);

    let second = queue.enqueue(single(&harness, "two", "alice", 2)).unwrap();
    let done = queue.wait_for(second).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded, "error: {:?}", done.error);
}
