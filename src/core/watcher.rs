//! Feed watcher: hides new posts the moment they appear, batches them into
//! debounced scan cycles, and reveals or keeps hiding each post once its
//! images have been compared against the reference set.

use crate::config::MuterConfig;
use crate::core::extractor::PostExtractor;
use crate::core::page::{
    ElementHandle, MutationRecord, Page, SharedPage, MARK_ATTR, MUTED_ATTR, PROCESSED_ATTR,
};
use crate::core::scheduler::ScanScheduler;
use crate::database::repositories::SettingsRepository;
use crate::database::SharedStore;
use crate::services::client::{ComparisonPair, SimilarityClient};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Muted,
    Shown,
}

/// Lifecycle of a tracked post. Untracked posts are unmarked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostState {
    /// Hidden and waiting for the next cycle.
    Marked,
    Scanning,
    Decided(Decision),
    /// No identity could be derived; released until its subtree changes.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct PostDecision {
    pub post_id: String,
    pub decision: Decision,
    pub best_similarity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub cycle: u64,
    pub scanned: usize,
    pub muted: usize,
    pub skipped: usize,
    pub stale: usize,
    pub decisions: Vec<PostDecision>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum WatchCommand {
    Rescan,
    UpdateReferences(Vec<String>),
    SetEnabled(bool),
    /// Acknowledged once every mutation queued before it has been handled.
    Sync(oneshot::Sender<()>),
    Inspect(oneshot::Sender<HashMap<ElementHandle, PostState>>),
    Shutdown,
}

/// Posts sharing one identity within a cycle.
#[derive(Debug, Clone)]
struct PostGroup {
    post_id: String,
    handles: Vec<ElementHandle>,
    images: Vec<String>,
}

struct ScanOutcome {
    epoch: u64,
    cycle: u64,
    scanned: usize,
    skipped: usize,
    stale: usize,
    decisions: Vec<(Vec<ElementHandle>, PostDecision)>,
}

/// Compare every image of every group against every reference and decide.
/// A single pair at or above `threshold` mutes its post regardless of the
/// order results come back in.
async fn evaluate(
    client: &SimilarityClient,
    groups: &[PostGroup],
    references: &[String],
    threshold: f64,
) -> Vec<PostDecision> {
    let pairs: Vec<ComparisonPair> = groups
        .iter()
        .flat_map(|group| group.images.iter())
        .flat_map(|image| {
            references
                .iter()
                .map(move |reference| ComparisonPair::new(image.clone(), reference.clone()))
        })
        .collect();

    let results = client.resolve_batch(&pairs).await;
    let scores: HashMap<(&str, &str), f64> = results
        .iter()
        .map(|r| ((r.candidate.as_str(), r.reference.as_str()), r.similarity))
        .collect();

    groups
        .iter()
        .map(|group| {
            let best_similarity = group
                .images
                .iter()
                .flat_map(|image| {
                    references.iter().filter_map(|reference| {
                        scores.get(&(image.as_str(), reference.as_str())).copied()
                    })
                })
                .fold(0.0_f64, f64::max);
            let decision = if best_similarity >= threshold {
                log::info!("Muted post {} (similarity {:.3})", group.post_id, best_similarity);
                Decision::Muted
            } else {
                log::debug!("Showing post {}", group.post_id);
                Decision::Shown
            };
            PostDecision {
                post_id: group.post_id.clone(),
                decision,
                best_similarity,
            }
        })
        .collect()
}

pub struct FeedWatcher {
    page: SharedPage,
    extractor: PostExtractor,
    client: Arc<SimilarityClient>,
    settings: SettingsRepository,
    threshold: f64,
    scheduler: ScanScheduler,
    references: Vec<String>,
    enabled: bool,
    posts: HashMap<ElementHandle, PostState>,
    pending: Vec<ElementHandle>,
    epoch: u64,
    cycle: u64,
    mutations: Option<mpsc::UnboundedReceiver<MutationRecord>>,
    in_flight: Option<JoinHandle<ScanOutcome>>,
    reports: broadcast::Sender<ScanReport>,
}

/// Control surface of a running watcher.
pub struct WatcherHandle {
    commands: mpsc::UnboundedSender<WatchCommand>,
    reports: broadcast::Sender<ScanReport>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    fn send(&self, command: WatchCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("Watcher is no longer running");
        }
    }

    pub fn rescan(&self) {
        self.send(WatchCommand::Rescan);
    }

    pub fn update_references(&self, urls: Vec<String>) {
        self.send(WatchCommand::UpdateReferences(urls));
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.send(WatchCommand::SetEnabled(enabled));
    }

    /// Wait until the watcher has handled everything sent or observed so far.
    pub async fn sync(&self) {
        let (ack, done) = oneshot::channel();
        self.send(WatchCommand::Sync(ack));
        let _ = done.await;
    }

    pub async fn post_states(&self) -> HashMap<ElementHandle, PostState> {
        let (reply, states) = oneshot::channel();
        self.send(WatchCommand::Inspect(reply));
        states.await.unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScanReport> {
        self.reports.subscribe()
    }

    pub async fn shutdown(self) {
        self.send(WatchCommand::Shutdown);
        let _ = self.task.await;
    }
}

async fn next_mutation(
    mutations: &mut Option<mpsc::UnboundedReceiver<MutationRecord>>,
) -> Option<MutationRecord> {
    match mutations {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn scan_finished(
    in_flight: &mut Option<JoinHandle<ScanOutcome>>,
) -> Result<ScanOutcome, JoinError> {
    match in_flight {
        Some(task) => task.await,
        None => pending().await,
    }
}

async fn timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

impl FeedWatcher {
    pub fn new(
        page: SharedPage,
        extractor: PostExtractor,
        client: Arc<SimilarityClient>,
        store: SharedStore,
        config: &MuterConfig,
    ) -> Self {
        let (reports, _) = broadcast::channel(64);
        Self {
            page,
            extractor,
            client,
            settings: SettingsRepository::new(store),
            threshold: config.similarity_threshold,
            scheduler: ScanScheduler::new(config.debounce(), config.debounce_max_wait()),
            references: Vec::new(),
            enabled: true,
            posts: HashMap::new(),
            pending: Vec::new(),
            epoch: 0,
            cycle: 0,
            mutations: None,
            in_flight: None,
            reports,
        }
    }

    /// Reports of cycles that finish after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanReport> {
        self.reports.subscribe()
    }

    pub fn spawn(self) -> WatcherHandle {
        let (commands, rx) = mpsc::unbounded_channel();
        let reports = self.reports.clone();
        let task = tokio::spawn(self.run(rx));
        WatcherHandle {
            commands,
            reports,
            task,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<WatchCommand>) {
        self.references = self.settings.load_reference_set().unwrap_or_else(|e| {
            log::warn!("Could not load muted images: {}", e);
            Vec::new()
        });
        self.enabled = self.settings.load_enabled().unwrap_or_else(|e| {
            log::warn!("Could not load enabled flag: {}", e);
            true
        });
        log::info!("Loaded {} muted images", self.references.len());
        if self.enabled {
            self.connect().await;
            self.scan_page().await;
        }

        loop {
            let deadline = self.scheduler.deadline();
            tokio::select! {
                biased;
                record = next_mutation(&mut self.mutations) => match record {
                    Some(record) => self.on_mutation(record).await,
                    None => self.mutations = None,
                },
                command = commands.recv() => match command {
                    None | Some(WatchCommand::Shutdown) => break,
                    Some(command) => self.on_command(command).await,
                },
                outcome = scan_finished(&mut self.in_flight) => {
                    self.in_flight = None;
                    self.on_scan_finished(outcome).await;
                }
                _ = timer(deadline) => self.on_timer().await,
            }
        }

        self.abandon();
        self.page.lock().await.disconnect();
        log::info!("Watcher stopped");
    }

    async fn connect(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.page.lock().await.observe(tx);
        self.mutations = Some(rx);
    }

    /// Hide `post` and queue it unless it is already on its way to a decision.
    fn mark(&mut self, page: &mut Page, post: ElementHandle) -> bool {
        match self.posts.get(&post) {
            None | Some(PostState::Skipped) => {}
            Some(_) => return false,
        }
        page.set_attr(post, MARK_ATTR, "true");
        page.remove_attr(post, PROCESSED_ATTR);
        page.remove_attr(post, MUTED_ATTR);
        self.posts.insert(post, PostState::Marked);
        self.pending.push(post);
        true
    }

    async fn on_mutation(&mut self, record: MutationRecord) {
        let page = self.page.clone();
        let mut page = page.lock().await;
        let mut marked = 0;

        for &added in &record.added {
            if !page.contains(added) {
                continue;
            }
            let posts = self.extractor.posts_in(&page, added);
            if posts.is_empty() {
                // Content arriving inside a post we could not identify earlier.
                if let Some(post) = page.closest(added, self.extractor.post_tag()) {
                    if self.posts.get(&post) == Some(&PostState::Skipped) && self.mark(&mut page, post) {
                        marked += 1;
                    }
                }
                continue;
            }
            for post in posts {
                if self.mark(&mut page, post) {
                    marked += 1;
                }
            }
        }
        page.acknowledge(&record.added);

        if marked > 0 {
            log::debug!("Marked {} new posts", marked);
            self.scheduler.notify(Instant::now());
        }
    }

    /// Mark every post currently on the page.
    async fn scan_page(&mut self) {
        if !self.enabled {
            return;
        }
        let page = self.page.clone();
        let mut page = page.lock().await;
        let root = page.root();
        let mut marked = 0;
        for post in self.extractor.posts_in(&page, root) {
            if self.mark(&mut page, post) {
                marked += 1;
            }
        }
        log::info!(
            "Queued {} posts for scanning against {} muted images",
            marked,
            self.references.len()
        );
        if marked > 0 {
            self.scheduler.notify(Instant::now());
        }
    }

    /// Forget every per-post decision and drop the current cycle's results.
    fn abandon(&mut self) {
        self.epoch += 1;
        if let Some(task) = self.in_flight.take() {
            task.abort();
        }
        self.scheduler.cancel();
        self.pending.clear();
        self.posts.clear();
    }

    async fn on_command(&mut self, command: WatchCommand) {
        match command {
            WatchCommand::Rescan => {
                log::info!("Rescan requested");
                self.abandon();
                self.scan_page().await;
            }
            WatchCommand::UpdateReferences(urls) => {
                log::info!("Updated muted images: {} entries", urls.len());
                self.references = urls;
                self.abandon();
                self.scan_page().await;
            }
            WatchCommand::SetEnabled(enabled) => self.set_enabled(enabled).await,
            WatchCommand::Sync(ack) => {
                while let Some(record) = self.mutations.as_mut().and_then(|rx| rx.try_recv().ok()) {
                    self.on_mutation(record).await;
                }
                let _ = ack.send(());
            }
            WatchCommand::Inspect(reply) => {
                let _ = reply.send(self.posts.clone());
            }
            WatchCommand::Shutdown => {}
        }
    }

    async fn set_enabled(&mut self, enabled: bool) {
        if let Err(e) = self.settings.save_enabled(enabled) {
            log::warn!("Could not persist enabled flag: {}", e);
        }
        if enabled == self.enabled {
            return;
        }
        self.enabled = enabled;

        if enabled {
            log::info!("Muting enabled");
            self.connect().await;
            self.scan_page().await;
            return;
        }

        log::info!("Muting disabled");
        self.abandon();
        self.mutations = None;
        let page = self.page.clone();
        let mut page = page.lock().await;
        page.disconnect();
        let root = page.root();
        for element in page.descendants_where(root, |e| e.attr(MARK_ATTR).is_some()) {
            page.remove_attr(element, MARK_ATTR);
            page.remove_attr(element, PROCESSED_ATTR);
            page.remove_attr(element, MUTED_ATTR);
        }
    }

    async fn on_timer(&mut self) {
        if !self.scheduler.fire(Instant::now()) {
            return;
        }
        if self.pending.is_empty() {
            self.scheduler.finish(Instant::now(), false);
            return;
        }

        self.cycle += 1;
        let batch = std::mem::take(&mut self.pending);
        log::info!("Found {} potential posts to scan", batch.len());

        let page = self.page.clone();
        let mut page = page.lock().await;
        let mut groups: Vec<PostGroup> = Vec::new();
        let mut index_by_id: HashMap<String, usize> = HashMap::new();
        let mut skipped = 0;
        let mut stale = 0;

        for post in &batch {
            let post = *post;
            if !page.contains(post) {
                self.posts.remove(&post);
                stale += 1;
                continue;
            }
            let Some(post_id) = self.extractor.identify(&page, post) else {
                self.posts.insert(post, PostState::Skipped);
                page.remove_attr(post, MARK_ATTR);
                skipped += 1;
                continue;
            };

            let images = self.extractor.extract_images(&page, post);
            log::debug!("Found {} images in post: {}", images.len(), post_id);
            self.posts.insert(post, PostState::Scanning);
            match index_by_id.get(&post_id) {
                Some(&i) => {
                    // Same logical post rendered twice: latest extraction wins.
                    groups[i].handles.push(post);
                    groups[i].images = images;
                }
                None => {
                    index_by_id.insert(post_id.clone(), groups.len());
                    groups.push(PostGroup {
                        post_id,
                        handles: vec![post],
                        images,
                    });
                }
            }
        }
        drop(page);

        let client = self.client.clone();
        let references = self.references.clone();
        let threshold = self.threshold;
        let epoch = self.epoch;
        let cycle = self.cycle;
        let scanned = batch.len();
        self.in_flight = Some(tokio::spawn(async move {
            let decisions = evaluate(&client, &groups, &references, threshold).await;
            ScanOutcome {
                epoch,
                cycle,
                scanned,
                skipped,
                stale,
                decisions: groups
                    .into_iter()
                    .map(|g| g.handles)
                    .zip(decisions)
                    .collect(),
            }
        }));
    }

    async fn on_scan_finished(&mut self, outcome: Result<ScanOutcome, JoinError>) {
        let outcome = match outcome {
            Ok(outcome) if outcome.epoch == self.epoch => outcome,
            Ok(outcome) => {
                log::debug!("Discarding results of abandoned cycle {}", outcome.cycle);
                return;
            }
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                log::error!("Scan cycle {} failed: {}", self.cycle, e);
                self.release_scanning().await;
                self.finish_cycle();
                return;
            }
        };

        let page = self.page.clone();
        let mut page = page.lock().await;
        let mut stale = outcome.stale;
        let mut muted = 0;
        let mut decisions = Vec::with_capacity(outcome.decisions.len());

        for (handles, decision) in outcome.decisions {
            let mut applied = false;
            for handle in handles {
                if !page.contains(handle) || self.posts.get(&handle) != Some(&PostState::Scanning) {
                    log::debug!("Dropping stale post handle for {}", decision.post_id);
                    self.posts.remove(&handle);
                    stale += 1;
                    continue;
                }
                let muted_value = if decision.decision == Decision::Muted {
                    "true"
                } else {
                    "false"
                };
                page.set_attr(handle, PROCESSED_ATTR, "true");
                page.set_attr(handle, MUTED_ATTR, muted_value);
                self.posts.insert(handle, PostState::Decided(decision.decision));
                applied = true;
            }
            if applied && decision.decision == Decision::Muted {
                muted += 1;
            }
            decisions.push(decision);
        }
        drop(page);

        log::info!(
            "Scan complete: Scanned {} posts, muted {} posts",
            outcome.scanned,
            muted
        );
        let _ = self.reports.send(ScanReport {
            cycle: outcome.cycle,
            scanned: outcome.scanned,
            muted,
            skipped: outcome.skipped,
            stale,
            decisions,
            finished_at: Utc::now(),
        });
        self.finish_cycle();
    }

    /// Show every post stuck in `Scanning` after a cycle died.
    async fn release_scanning(&mut self) {
        let page = self.page.clone();
        let mut page = page.lock().await;
        for (handle, state) in self.posts.iter_mut() {
            if *state == PostState::Scanning {
                page.set_attr(*handle, PROCESSED_ATTR, "true");
                page.set_attr(*handle, MUTED_ATTR, "false");
                *state = PostState::Decided(Decision::Shown);
            }
        }
    }

    fn finish_cycle(&mut self) {
        let follow_up = !self.pending.is_empty();
        if self.scheduler.finish(Instant::now(), follow_up) {
            log::debug!("{} posts arrived during the scan", self.pending.len());
        }
    }
}
