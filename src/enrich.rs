//! Enrichment of the pull request list.
//!
//! The [`Board`] owns all per-PR state and never performs I/O: every
//! operation returns [`Command`]s, and every finished command comes back as
//! an [`Event`] that the board applies, possibly returning more commands.
//! The [`Enricher`] runs commands as tokio tasks that report back over a
//! channel, and [`Enricher::settle`] drives the loop until no work is left.

use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    agent::Agent,
    gateway::Gateway,
    prompt::AnalysisInput,
    types::{Analysis, CheckStatus, DiffStats, MergeMethod, PrKey, PullRequest, Review},
};

pub const DEFAULT_STAGGER: Duration = Duration::from_millis(50);

/// Load state of one enrichment field.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Loading,
    Loaded(T),
    Failed(String),
}

impl<T> Field<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, Field::Loading)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Field::Failed(_))
    }

    pub fn loaded(&self) -> Option<&T> {
        match self {
            Field::Loaded(value) => Some(value),
            _ => None,
        }
    }

    fn from_result(result: Result<T, String>) -> Self {
        match result {
            Ok(value) => Field::Loaded(value),
            Err(e) => Field::Failed(e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisState {
    Disabled,
    /// Waiting for diff, checks and reviews.
    Waiting,
    Running,
    Done(Analysis),
    Failed(String),
    Skipped(&'static str),
}

/// Everything the board knows about one pull request.
#[derive(Debug, Clone)]
pub struct PrState {
    pub pr: PullRequest,
    pub diff_stats: Field<DiffStats>,
    pub check_status: Field<CheckStatus>,
    pub reviews: Field<Vec<Review>>,
    pub analysis: AnalysisState,
    pub auto_merge: bool,
    /// Error from the last approve/merge/auto-merge attempt.
    pub action_error: Option<String>,
}

impl PrState {
    fn loading(pr: PullRequest, ai_enabled: bool) -> Self {
        Self {
            pr,
            diff_stats: Field::Loading,
            check_status: Field::Loading,
            reviews: Field::Loading,
            analysis: if ai_enabled {
                AnalysisState::Waiting
            } else {
                AnalysisState::Disabled
            },
            auto_merge: false,
            action_error: None,
        }
    }

    pub fn key(&self) -> PrKey {
        self.pr.key()
    }
}

/// Work for the [`Enricher`]. Fetches carry the delay they wait before
/// starting so a large list does not hit the API all at once.
#[derive(Debug, Clone)]
pub enum Command {
    FetchPrs { fresh: bool },
    FetchDiffStats { pr: PullRequest, delay: Duration },
    FetchCheckStatus { pr: PullRequest, delay: Duration },
    /// `generation` increases with every reviews fetch of the PR; only the
    /// latest one is applied.
    FetchReviews {
        pr: PrKey,
        delay: Duration,
        generation: u64,
    },
    /// Drop cached diff/check data before they are fetched again.
    InvalidateCommitData(PrKey),
    Analyze(Box<AnalysisInput>),
    Approve(PullRequest),
    Merge(PullRequest, MergeMethod),
    EnableAutoMerge(PullRequest, MergeMethod),
}

/// Outcome of one command. Commit-dependent results carry the head SHA
/// they were fetched for so results for a superseded commit are dropped.
#[derive(Debug, Clone)]
pub enum Event {
    PrsLoaded(Result<Vec<PullRequest>, String>),
    DiffStatsLoaded {
        pr: PrKey,
        head_sha: String,
        result: Result<DiffStats, String>,
    },
    CheckStatusLoaded {
        pr: PrKey,
        head_sha: String,
        result: Result<CheckStatus, String>,
    },
    ReviewsLoaded {
        pr: PrKey,
        generation: u64,
        result: Result<Vec<Review>, String>,
    },
    AnalysisFinished {
        pr: PrKey,
        head_sha: String,
        result: Result<Analysis, String>,
    },
    Approved {
        pr: PrKey,
        result: Result<(), String>,
    },
    Merged {
        pr: PrKey,
        result: Result<(), String>,
    },
    AutoMergeEnabled {
        pr: PrKey,
        result: Result<(), String>,
    },
}

/// State of the pull request list and every PR's enrichment.
#[derive(Debug)]
pub struct Board {
    prs: Vec<PrState>,
    /// Analyses started per `(pr, head_sha)`, with their outcome once
    /// finished.
    analyzed: HashMap<(PrKey, String), Option<Result<Analysis, String>>>,
    /// Latest reviews fetch issued per PR.
    review_generation: HashMap<PrKey, u64>,
    ai_enabled: bool,
    stagger: Duration,
    list_error: Option<String>,
}

impl Board {
    pub fn new(ai_enabled: bool, stagger: Duration) -> Self {
        Self {
            prs: Vec::new(),
            analyzed: HashMap::new(),
            review_generation: HashMap::new(),
            ai_enabled,
            stagger,
            list_error: None,
        }
    }

    pub fn prs(&self) -> &[PrState] {
        &self.prs
    }

    pub fn get(&self, pr: &PrKey) -> Option<&PrState> {
        self.prs.iter().find(|state| state.pr.key() == *pr)
    }

    fn get_mut(&mut self, pr: &PrKey) -> Option<&mut PrState> {
        self.prs.iter_mut().find(|state| state.pr.key() == *pr)
    }

    /// Error from the last list fetch, if it failed.
    pub fn list_error(&self) -> Option<&str> {
        self.list_error.as_deref()
    }

    /// Loads the list, from cache when possible.
    pub fn fetch_prs(&self) -> Vec<Command> {
        vec![Command::FetchPrs { fresh: false }]
    }

    /// Reloads the list bypassing the cache. Existing state is reconciled
    /// when the result arrives.
    pub fn refresh_all(&self) -> Vec<Command> {
        vec![Command::FetchPrs { fresh: true }]
    }

    pub fn fetch_diff_stats(&mut self, pr: &PrKey) -> Vec<Command> {
        let Some(state) = self.get_mut(pr) else {
            return vec![];
        };
        state.diff_stats = Field::Loading;
        vec![Command::FetchDiffStats {
            pr: state.pr.clone(),
            delay: Duration::ZERO,
        }]
    }

    pub fn fetch_check_status(&mut self, pr: &PrKey) -> Vec<Command> {
        let Some(state) = self.get_mut(pr) else {
            return vec![];
        };
        state.check_status = Field::Loading;
        vec![Command::FetchCheckStatus {
            pr: state.pr.clone(),
            delay: Duration::ZERO,
        }]
    }

    pub fn fetch_reviews(&mut self, pr: &PrKey) -> Vec<Command> {
        let Some(state) = self.get_mut(pr) else {
            return vec![];
        };
        state.reviews = Field::Loading;
        vec![self.next_reviews_fetch(pr, Duration::ZERO)]
    }

    fn next_reviews_fetch(&mut self, pr: &PrKey, delay: Duration) -> Command {
        let generation = self.review_generation.entry(pr.clone()).or_default();
        *generation += 1;
        Command::FetchReviews {
            pr: pr.clone(),
            delay,
            generation: *generation,
        }
    }

    /// Drops the bookkeeping kept for a PR that left the list.
    fn forget(&mut self, pr: &PrKey) {
        self.analyzed.retain(|(key, _), _| key != pr);
        self.review_generation.remove(pr);
    }

    pub fn approve(&self, pr: &PrKey) -> Vec<Command> {
        self.get(pr)
            .map(|state| vec![Command::Approve(state.pr.clone())])
            .unwrap_or_default()
    }

    pub fn merge(&self, pr: &PrKey, method: MergeMethod) -> Vec<Command> {
        self.get(pr)
            .map(|state| vec![Command::Merge(state.pr.clone(), method)])
            .unwrap_or_default()
    }

    pub fn enable_auto_merge(&self, pr: &PrKey, method: MergeMethod) -> Vec<Command> {
        self.get(pr)
            .map(|state| vec![Command::EnableAutoMerge(state.pr.clone(), method)])
            .unwrap_or_default()
    }

    /// Starts the analysis if the PR is ready and none was started for its
    /// current head yet. A head analysed before (the PR moved away and
    /// back) gets that run's outcome, or waits for it if still running.
    pub fn analyze_if_ready(&mut self, pr: &PrKey) -> Vec<Command> {
        let ai_enabled = self.ai_enabled;
        let Some(state) = self.prs.iter_mut().find(|state| state.pr.key() == *pr) else {
            return vec![];
        };
        if !ai_enabled {
            return vec![];
        }
        if state.diff_stats.is_loading()
            || state.check_status.is_loading()
            || state.reviews.is_loading()
        {
            return vec![];
        }
        if matches!(state.analysis, AnalysisState::Running | AnalysisState::Done(_)) {
            return vec![];
        }

        let (Field::Loaded(diff_stats), Field::Loaded(check_status), Field::Loaded(reviews)) =
            (&state.diff_stats, &state.check_status, &state.reviews)
        else {
            debug!(pr = %pr, "Skipping analysis, enrichment failed");
            state.analysis = AnalysisState::Skipped("enrichment failed");
            return vec![];
        };
        if state.pr.head_sha.is_empty() {
            debug!(pr = %pr, "Skipping analysis, head commit unknown");
            state.analysis = AnalysisState::Skipped("head commit unknown");
            return vec![];
        }
        let analysis_key = (pr.clone(), state.pr.head_sha.clone());
        if let Some(outcome) = self.analyzed.get(&analysis_key) {
            state.analysis = match outcome {
                Some(Ok(analysis)) => AnalysisState::Done(analysis.clone()),
                Some(Err(e)) => AnalysisState::Failed(e.clone()),
                None => AnalysisState::Running,
            };
            return vec![];
        }
        self.analyzed.insert(analysis_key, None);

        state.analysis = AnalysisState::Running;
        vec![Command::Analyze(Box::new(AnalysisInput {
            pr: state.pr.clone(),
            diff_stats: *diff_stats,
            check_status: check_status.clone(),
            reviews: reviews.clone(),
        }))]
    }

    /// Applies a finished command and returns the follow-up work.
    pub fn apply(&mut self, event: Event) -> Vec<Command> {
        match event {
            Event::PrsLoaded(Ok(prs)) => {
                self.list_error = None;
                self.reconcile(prs)
            }
            Event::PrsLoaded(Err(e)) => {
                self.list_error = Some(e);
                vec![]
            }
            Event::DiffStatsLoaded {
                pr,
                head_sha,
                result,
            } => {
                match self.get_mut(&pr) {
                    Some(state) if state.pr.head_sha == head_sha => {
                        state.diff_stats = Field::from_result(result);
                    }
                    _ => {
                        debug!(pr = %pr, head_sha, "Dropping stale diff stats");
                        return vec![];
                    }
                }
                self.analyze_if_ready(&pr)
            }
            Event::CheckStatusLoaded {
                pr,
                head_sha,
                result,
            } => {
                match self.get_mut(&pr) {
                    Some(state) if state.pr.head_sha == head_sha => {
                        state.check_status = Field::from_result(result);
                    }
                    _ => {
                        debug!(pr = %pr, head_sha, "Dropping stale check status");
                        return vec![];
                    }
                }
                self.analyze_if_ready(&pr)
            }
            Event::ReviewsLoaded {
                pr,
                generation,
                result,
            } => {
                if self.review_generation.get(&pr) != Some(&generation) {
                    debug!(pr = %pr, generation, "Dropping superseded reviews");
                    return vec![];
                }
                let Some(state) = self.get_mut(&pr) else {
                    return vec![];
                };
                state.reviews = Field::from_result(result);
                self.analyze_if_ready(&pr)
            }
            Event::AnalysisFinished {
                pr,
                head_sha,
                result,
            } => {
                if let Some(outcome) = self.analyzed.get_mut(&(pr.clone(), head_sha.clone())) {
                    *outcome = Some(result.clone());
                }
                if let Some(state) = self.get_mut(&pr) {
                    if state.pr.head_sha == head_sha {
                        state.analysis = match result {
                            Ok(analysis) => AnalysisState::Done(analysis),
                            Err(e) => AnalysisState::Failed(e),
                        };
                    }
                }
                vec![]
            }
            Event::Approved { pr, result } => match result {
                Ok(()) => {
                    if let Some(state) = self.get_mut(&pr) {
                        state.action_error = None;
                    }
                    self.fetch_reviews(&pr)
                }
                Err(e) => {
                    self.record_action_error(&pr, e);
                    vec![]
                }
            },
            Event::Merged { pr, result } => {
                match result {
                    Ok(()) => {
                        self.prs.retain(|state| state.pr.key() != pr);
                        self.forget(&pr);
                    }
                    Err(e) => self.record_action_error(&pr, e),
                }
                vec![]
            }
            Event::AutoMergeEnabled { pr, result } => {
                if let Some(state) = self.get_mut(&pr) {
                    match result {
                        Ok(()) => {
                            state.auto_merge = true;
                            state.action_error = None;
                        }
                        Err(e) => state.action_error = Some(e),
                    }
                }
                vec![]
            }
        }
    }

    fn record_action_error(&mut self, pr: &PrKey, error: String) {
        if let Some(state) = self.get_mut(pr) {
            state.action_error = Some(error);
        }
    }

    /// Replaces the list with `prs`, keeping what is still valid.
    ///
    /// A PR whose head is unchanged keeps its diff, checks and analysis
    /// and only re-fetches reviews (plus any field that had failed). A PR
    /// whose head moved starts over and its commit data is invalidated.
    /// New PRs load everything; PRs no longer returned are dropped.
    fn reconcile(&mut self, prs: Vec<PullRequest>) -> Vec<Command> {
        let mut previous = std::mem::take(&mut self.prs);
        let mut commands = Vec::new();

        for (index, pr) in prs.into_iter().enumerate() {
            let delay = self.stagger * index as u32;
            let key = pr.key();
            let existing = previous
                .iter()
                .position(|state| state.pr.key() == key)
                .map(|pos| previous.swap_remove(pos));

            let state = match existing {
                Some(mut state) if state.pr.head_sha == pr.head_sha => {
                    state.pr = pr;
                    state.reviews = Field::Loading;
                    if state.diff_stats.is_failed() {
                        state.diff_stats = Field::Loading;
                        commands.push(Command::FetchDiffStats {
                            pr: state.pr.clone(),
                            delay,
                        });
                    }
                    if state.check_status.is_failed() {
                        state.check_status = Field::Loading;
                        commands.push(Command::FetchCheckStatus {
                            pr: state.pr.clone(),
                            delay,
                        });
                    }
                    if matches!(state.analysis, AnalysisState::Skipped(_)) {
                        state.analysis = AnalysisState::Waiting;
                    }
                    commands.push(self.next_reviews_fetch(&key, delay));
                    state
                }
                Some(state) => {
                    info!(
                        pr = %key,
                        old = %state.pr.head_sha,
                        new = %pr.head_sha,
                        "Head commit changed"
                    );
                    commands.push(Command::InvalidateCommitData(key.clone()));
                    let mut fresh = PrState::loading(pr, self.ai_enabled);
                    fresh.auto_merge = state.auto_merge;
                    commands.extend(self.full_load(&fresh, delay));
                    fresh
                }
                None => {
                    let fresh = PrState::loading(pr, self.ai_enabled);
                    commands.extend(self.full_load(&fresh, delay));
                    fresh
                }
            };
            self.prs.push(state);
        }

        for gone in previous {
            let key = gone.key();
            debug!(pr = %key, "Pull request no longer listed");
            self.forget(&key);
        }
        commands
    }

    fn full_load(&mut self, state: &PrState, delay: Duration) -> [Command; 3] {
        [
            Command::FetchDiffStats {
                pr: state.pr.clone(),
                delay,
            },
            Command::FetchCheckStatus {
                pr: state.pr.clone(),
                delay,
            },
            self.next_reviews_fetch(&state.key(), delay),
        ]
    }
}

/// Runs [`Command`]s against the gateway and the agent.
pub struct Enricher {
    gateway: Arc<Gateway>,
    agent: Option<Arc<Agent>>,
    query: String,
    github_timeout: Duration,
    tx: mpsc::UnboundedSender<Event>,
    rx: mpsc::UnboundedReceiver<Event>,
    in_flight: usize,
}

async fn within<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T, String> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(_) => Err(format!("timed out after {timeout:?}")),
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

impl Enricher {
    pub fn new(
        gateway: Arc<Gateway>,
        agent: Option<Arc<Agent>>,
        query: impl Into<String>,
        github_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            gateway,
            agent,
            query: query.into(),
            github_timeout,
            tx,
            rx,
            in_flight: 0,
        }
    }

    /// Number of commands whose event has not been received yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        let tx = self.tx.clone();
        self.in_flight += 1;
        tokio::spawn(async move {
            let event = task.await;
            if tx.send(event).is_err() {
                debug!("Enricher dropped before event was delivered");
            }
        });
    }

    /// Starts `command`. Cache invalidation runs inline so fetches
    /// dispatched after it cannot read stale entries.
    pub async fn dispatch(&mut self, command: Command) {
        let gateway = self.gateway.clone();
        let timeout = self.github_timeout;

        match command {
            Command::FetchPrs { fresh } => {
                let query = self.query.clone();
                self.spawn(async move {
                    let result = if fresh {
                        within(timeout, gateway.search_fresh(&query)).await
                    } else {
                        within(timeout, gateway.search(&query)).await
                    };
                    Event::PrsLoaded(result)
                });
            }
            Command::FetchDiffStats { pr, delay } => self.spawn(async move {
                pause(delay).await;
                let key = pr.key();
                let result = within(timeout, gateway.diff_stats(&key, &pr.head_sha)).await;
                Event::DiffStatsLoaded {
                    pr: key,
                    head_sha: pr.head_sha,
                    result,
                }
            }),
            Command::FetchCheckStatus { pr, delay } => self.spawn(async move {
                pause(delay).await;
                let key = pr.key();
                let result = within(timeout, gateway.check_status(&key, &pr.head_sha)).await;
                Event::CheckStatusLoaded {
                    pr: key,
                    head_sha: pr.head_sha,
                    result,
                }
            }),
            Command::FetchReviews {
                pr,
                delay,
                generation,
            } => self.spawn(async move {
                pause(delay).await;
                let result = within(timeout, gateway.reviews(&pr)).await;
                Event::ReviewsLoaded {
                    pr,
                    generation,
                    result,
                }
            }),
            Command::InvalidateCommitData(pr) => {
                self.gateway.invalidate_commit_data(&pr).await;
            }
            Command::Analyze(input) => {
                let agent = self.agent.clone();
                self.spawn(async move {
                    let result = match agent {
                        Some(agent) => agent.analyze(&input).await.map_err(|e| e.to_string()),
                        None => Err("AI analysis is disabled".to_string()),
                    };
                    if let Err(e) = &result {
                        warn!(pr = %input.pr.key(), error = %e, "Analysis failed");
                    }
                    Event::AnalysisFinished {
                        pr: input.pr.key(),
                        head_sha: input.pr.head_sha.clone(),
                        result,
                    }
                });
            }
            Command::Approve(pr) => self.spawn(async move {
                let result = within(timeout, gateway.approve(&pr)).await;
                Event::Approved {
                    pr: pr.key(),
                    result,
                }
            }),
            Command::Merge(pr, method) => self.spawn(async move {
                let result = within(timeout, gateway.merge(&pr, method)).await;
                Event::Merged {
                    pr: pr.key(),
                    result,
                }
            }),
            Command::EnableAutoMerge(pr, method) => self.spawn(async move {
                let result = within(timeout, gateway.enable_auto_merge(&pr, method)).await;
                Event::AutoMergeEnabled {
                    pr: pr.key(),
                    result,
                }
            }),
        }
    }

    /// Waits for the next finished command. Returns `None` when nothing is
    /// in flight.
    pub async fn next_event(&mut self) -> Option<Event> {
        if self.in_flight == 0 {
            return None;
        }
        let event = self.rx.recv().await?;
        self.in_flight -= 1;
        Some(event)
    }

    /// Dispatches `commands`, then applies events to `board` and dispatches
    /// their follow-ups until no work is outstanding. Every event is shown
    /// to `on_event` before it is applied.
    pub async fn settle(
        &mut self,
        board: &mut Board,
        commands: Vec<Command>,
        mut on_event: impl FnMut(&Event),
    ) {
        for command in commands {
            self.dispatch(command).await;
        }
        while let Some(event) = self.next_event().await {
            on_event(&event);
            for command in board.apply(event) {
                self.dispatch(command).await;
            }
        }
    }
}
