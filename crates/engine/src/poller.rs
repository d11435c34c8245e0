//! Console/pipeline poller: coalesces identical polls into one remote call.
//!
//! Every (node, view, job, build) key owns one async mutex. The first caller
//! for a key takes the lock and performs the remote call; callers arriving
//! meanwhile queue on the lock and, once it is released, find the answer
//! fresh in the slot and return it without a remote call of their own. Both
//! successes and failures are shared for the TTL so that a node that is down
//! is not hammered by every dashboard polling it.
//!
//! The remote call runs inside the lock holder's future. If that caller goes
//! away, the call is dropped with it and the next queued caller becomes the
//! fetcher, so a key never has more than one call outstanding.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use hub::{
    BuildKey, BuildNumber, ConsoleChunk, JobName, NodeId, PipelineOverview, RemoteError, StageId,
    StageLog,
};

use crate::cache::Slots;

// ---------------------------------------------------------------------------
// Shared answers
// ---------------------------------------------------------------------------

/// Last answer for a key and when it was obtained.
struct Cached<V> {
    answer: Option<(Result<V, RemoteError>, Instant)>,
}

impl<V> Default for Cached<V> {
    fn default() -> Self {
        Self { answer: None }
    }
}

impl<V> Cached<V> {
    fn older_than(&self, age: Duration) -> bool {
        self.answer.as_ref().map_or(true, |(_, at)| at.elapsed() >= age)
    }
}

/// Runs `fetch` under the slot's lock unless a fresh answer is already there.
async fn coalesce<V, F, Fut>(
    slot: Arc<Mutex<Cached<V>>>,
    ttl: Duration,
    fetch: F,
) -> Result<V, RemoteError>
where
    V: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, RemoteError>>,
{
    let mut cached = slot.lock().await;
    if let Some((answer, at)) = &cached.answer {
        if at.elapsed() < ttl {
            trace!("serving coalesced answer");
            return answer.clone();
        }
    }
    let answer = fetch().await;
    cached.answer = Some((answer.clone(), Instant::now()));
    answer
}

// ---------------------------------------------------------------------------
// Console snapshots
// ---------------------------------------------------------------------------

/// Console text retrieved so far for one build.
///
/// Holds remote bytes `[start, end)`. `aligned` records whether the text length
/// has always matched the remote's offsets; only then can the snapshot be
/// sliced at arbitrary offsets.
struct ConsoleSnapshot {
    start: u64,
    end: u64,
    text: String,
    aligned: bool,
    complete: bool,
    fetched_at: Instant,
}

impl ConsoleSnapshot {
    fn from_chunk(offset: u64, chunk: &ConsoleChunk) -> Self {
        Self {
            start: offset,
            end: chunk.next_offset,
            text: chunk.text.clone(),
            aligned: chunk.next_offset == offset + chunk.text.len() as u64,
            complete: chunk.complete,
            fetched_at: Instant::now(),
        }
    }

    /// Text from `offset` to `end`, if the snapshot can answer for `offset`.
    fn text_from(&self, offset: u64) -> Option<&str> {
        if offset == self.end {
            return Some("");
        }
        if offset == self.start {
            return Some(&self.text);
        }
        if self.aligned && (self.start..self.end).contains(&offset) {
            let index = usize::try_from(offset - self.start).ok()?;
            return self.text.get(index..);
        }
        None
    }

    fn append(&mut self, from: u64, chunk: &ConsoleChunk) {
        self.aligned &= chunk.next_offset == from + chunk.text.len() as u64;
        self.text.push_str(&chunk.text);
        self.end = chunk.next_offset;
        self.complete = chunk.complete;
        self.fetched_at = Instant::now();
    }
}

#[derive(Default)]
struct ConsoleSlot {
    snapshot: Option<ConsoleSnapshot>,
    failure: Option<(RemoteError, Instant)>,
}

impl ConsoleSlot {
    fn last_touched(&self) -> Option<Instant> {
        let snap = self.snapshot.as_ref().map(|s| s.fetched_at);
        let fail = self.failure.as_ref().map(|f| f.1);
        snap.max(fail)
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Coalescing, short-TTL front for console and pipeline reads.
pub(crate) struct Poller {
    ttl: Duration,
    console: Slots<BuildKey, ConsoleSlot>,
    overview: Slots<BuildKey, Cached<PipelineOverview>>,
    stage_logs: Slots<(BuildKey, StageId), Cached<StageLog>>,
}

impl Poller {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            console: Slots::new(),
            overview: Slots::new(),
            stage_logs: Slots::new(),
        }
    }

    /// Returns console text of `key` from `offset`.
    ///
    /// `fetch(from)` asks the node for text starting at `from`. When the
    /// snapshot already covers `offset`, only the tail past the snapshot is
    /// requested and the answer is the snapshot text from `offset` plus that
    /// tail, so consecutive polls never skip or repeat bytes.
    pub async fn console<F, Fut>(
        &self,
        key: &BuildKey,
        offset: u64,
        fetch: F,
    ) -> Result<ConsoleChunk, RemoteError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<ConsoleChunk, RemoteError>>,
    {
        let slot = self.console.slot(key);
        let mut state = slot.lock().await;

        let mut prefix = None;
        if let Some(snap) = &state.snapshot {
            if let Some(text) = snap.text_from(offset) {
                if snap.complete || snap.fetched_at.elapsed() < self.ttl {
                    return Ok(ConsoleChunk {
                        text: text.to_string(),
                        next_offset: snap.end,
                        complete: snap.complete,
                    });
                }
                prefix = Some((text.to_string(), snap.end));
            }
        }
        if let Some((err, at)) = &state.failure {
            if at.elapsed() < self.ttl {
                return Err(err.clone());
            }
        }

        let from = prefix.as_ref().map_or(offset, |(_, end)| *end);
        debug!(job = %key.job, build = %key.build, from, "fetching console");
        let chunk = match fetch(from).await {
            Ok(chunk) => chunk,
            Err(err) => {
                state.failure = Some((err.clone(), Instant::now()));
                return Err(err);
            }
        };
        state.failure = None;

        match (prefix, state.snapshot.as_mut()) {
            (Some((text, _)), Some(snap)) => {
                snap.append(from, &chunk);
                Ok(ConsoleChunk {
                    text: text + &chunk.text,
                    next_offset: chunk.next_offset,
                    complete: chunk.complete,
                })
            }
            _ => {
                state.snapshot = Some(ConsoleSnapshot::from_chunk(offset, &chunk));
                Ok(chunk)
            }
        }
    }

    /// Returns the pipeline overview of `key`, shared across pollers.
    pub async fn overview<F, Fut>(
        &self,
        key: &BuildKey,
        fetch: F,
    ) -> Result<PipelineOverview, RemoteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<PipelineOverview, RemoteError>>,
    {
        coalesce(self.overview.slot(key), self.ttl, fetch).await
    }

    /// Returns the log of one stage of `key`, shared across pollers.
    pub async fn stage_log<F, Fut>(
        &self,
        key: &BuildKey,
        stage: &StageId,
        fetch: F,
    ) -> Result<StageLog, RemoteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StageLog, RemoteError>>,
    {
        let slot = self.stage_logs.slot(&(key.clone(), stage.clone()));
        coalesce(slot, self.ttl, fetch).await
    }

    /// Forgets everything about one build, in every view it was polled through.
    pub fn invalidate_build(&self, node: NodeId, job: &JobName, build: BuildNumber) {
        let hit = |k: &BuildKey| k.node == node && &k.job == job && k.build == build;
        self.console.remove_where(|k| hit(k));
        self.overview.remove_where(|k| hit(k));
        self.stage_logs.remove_where(|(k, _)| hit(k));
    }

    /// Forgets everything about one node.
    pub fn invalidate_node(&self, node: NodeId) {
        self.console.remove_where(|k| k.node == node);
        self.overview.remove_where(|k| k.node == node);
        self.stage_logs.remove_where(|(k, _)| k.node == node);
    }

    /// Drops idle entries not touched within `retention`.
    pub fn sweep(&self, retention: Duration) -> usize {
        self.console
            .sweep(|s| s.last_touched().map_or(true, |at| at.elapsed() >= retention))
            + self.overview.sweep(|c| c.older_than(retention))
            + self.stage_logs.sweep(|c| c.older_than(retention))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use hub::{StageStatus, ViewId};

    const TTL: Duration = Duration::from_secs(2);

    fn key(build: u64) -> BuildKey {
        BuildKey {
            node: NodeId::new_random(),
            view: ViewId::new("all").unwrap(),
            job: JobName::new("deploy").unwrap(),
            build: BuildNumber::new(build),
        }
    }

    fn log_chunk(log: &str, from: u64, complete: bool) -> ConsoleChunk {
        ConsoleChunk {
            text: log[from as usize..].to_string(),
            next_offset: log.len() as u64,
            complete,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_overview_polls_share_one_call() {
        let poller = Poller::new(TTL);
        let key = key(1);
        let calls = AtomicUsize::new(0);
        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(PipelineOverview {
                build_id: BuildNumber::new(1),
                status: StageStatus::InProgress,
                stages: vec![],
            })
        };

        let (a, b, c) = tokio::join!(
            poller.overview(&key, fetch),
            poller.overview(&key, fetch),
            poller.overview(&key, fetch),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.clone().unwrap());
        assert_eq!(b.unwrap(), c.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_shared_then_retried_after_ttl() {
        let poller = Poller::new(TTL);
        let key = key(1);
        let calls = AtomicUsize::new(0);
        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<PipelineOverview, _>(RemoteError::unreachable("down"))
        };

        assert!(poller.overview(&key, fetch).await.is_err());
        assert!(poller.overview(&key, fetch).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(TTL).await;
        assert!(poller.overview(&key, fetch).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn console_polls_are_contiguous_and_fetch_only_the_tail() {
        let poller = Poller::new(TTL);
        let key = key(4);
        let requested = std::sync::Mutex::new(Vec::new());

        let first = poller
            .console(&key, 0, |from| {
                requested.lock().unwrap().push(from);
                async move { Ok(log_chunk("abc", from, false)) }
            })
            .await
            .unwrap();
        assert_eq!((first.text.as_str(), first.next_offset), ("abc", 3));

        tokio::time::advance(TTL).await;
        let second = poller
            .console(&key, first.next_offset, |from| {
                requested.lock().unwrap().push(from);
                async move { Ok(log_chunk("abcdef", from, true)) }
            })
            .await
            .unwrap();
        assert_eq!((second.text.as_str(), second.next_offset), ("def", 6));
        assert!(second.complete);

        // A late poller starting mid-way is served from the snapshot.
        let late = poller
            .console(&key, 1, |_| async { Err(RemoteError::unreachable("unused")) })
            .await
            .unwrap();
        assert_eq!(late.text, "bcdef");
        assert_eq!(*requested.lock().unwrap(), vec![0, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_prefix_is_joined_with_the_fetched_tail() {
        let poller = Poller::new(TTL);
        let key = key(4);
        poller
            .console(&key, 0, |from| async move { Ok(log_chunk("abc", from, false)) })
            .await
            .unwrap();

        tokio::time::advance(TTL).await;
        let chunk = poller
            .console(&key, 1, |from| async move {
                assert_eq!(from, 3);
                Ok(log_chunk("abcde", from, false))
            })
            .await
            .unwrap();
        assert_eq!(chunk.text, "bcde");
        assert_eq!(chunk.next_offset, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidated_build_is_fetched_again() {
        let poller = Poller::new(TTL);
        let key = key(9);
        let calls = AtomicUsize::new(0);
        let fetch = |from: u64| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok(log_chunk("done", from, true)) }
        };

        poller.console(&key, 0, fetch).await.unwrap();
        poller.console(&key, 0, fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        poller.invalidate_build(key.node, &key.job, key.build);
        poller.console(&key, 0, fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_keeps_recent_entries() {
        let poller = Poller::new(TTL);
        let old = key(1);
        let recent = key(2);
        poller
            .console(&old, 0, |from| async move { Ok(log_chunk("x", from, true)) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;
        poller
            .console(&recent, 0, |from| async move { Ok(log_chunk("y", from, true)) })
            .await
            .unwrap();

        assert_eq!(poller.sweep(Duration::from_secs(60)), 1);
        assert_eq!(poller.console.len(), 1);
    }
}
