//! Entry points for transport events and the job runner behind them.
//!
//! The transport calls one method per inbound event and gets back either a
//! prompt to show or the handle of a started job. Jobs run as independent
//! tasks; their progress reaches the transport through [`Transport::render`]
//! and their result through [`Transport::deliver`].

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use strum::IntoEnumIterator;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::acquire::{AcquireRequest, AcquiredFile, Acquirer, FormatOption};
use crate::cleanup::{JobPaths, TempPath, ensure_dir_all, file_size, purge_job_files};
use crate::config::{
    AppConfig, COMPRESS_TARGET_MB, MIB, RESOLUTION_PRESETS, TargetDims, is_subtitle_extension,
};
use crate::jobs::{JobContext, JobGuard, JobId, JobInfo, JobKind, JobRegistry};
use crate::preferences::PreferenceStore;
use crate::progress::{ProgressEvent, ProgressReporter, ProgressUpdate, Stage};
use crate::session::{Choice, Phase, SessionState, SessionStore, Source, classify_link};
use crate::transcode::{ExtractFormat, StreamInfo, TranscodeEngine};
use crate::utils::filename::{extension_of, output_filename, sanitize_filename};
use crate::utils::format::{format_elapsed, format_size, progress_bar};
use crate::{Error, Result};

/// Cap for subtitles fetched from a link.
pub const SUBTITLE_URL_LIMIT: u64 = 10 * MIB;
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

/// A finished file handed to the transport. The file is removed once
/// [`Transport::deliver`] returns, so the transport must copy or move it.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub job_id: JobId,
    pub path: PathBuf,
    /// Suggested name for the user.
    pub file_name: String,
    pub size: u64,
    pub elapsed: Duration,
}

/// Outbound side of the chat transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Show text to `user`. May be throttled or dropped by the transport.
    async fn render(&self, user: &str, text: &str);

    async fn deliver(&self, user: &str, artifact: Artifact) -> Result<()>;
}

/// A parameter event for the awaiting phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parameter {
    SubtitleUpload {
        file_ref: String,
        name: String,
        size: u64,
    },
    SubtitleUrl(String),
    Resolution(String),
    /// Target size in MB, as typed.
    CompressTarget(String),
    /// 1-based entry of the quality menu.
    Format(usize),
    Stream {
        index: u32,
        format: String,
    },
}

#[derive(Debug)]
pub enum Response {
    Prompt(String),
    Started {
        job_id: JobId,
        handle: JoinHandle<()>,
    },
}

impl Response {
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Prompt(text) => Some(text),
            Self::Started { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
enum SubtitleSource {
    Upload { file_ref: String, name: String },
    Url(String),
}

#[derive(Debug)]
enum Pipeline {
    Download {
        format: Option<String>,
        title: Option<String>,
    },
    Info,
    BurnSubtitles(SubtitleSource),
    Resolution(TargetDims),
    Compress {
        target_bytes: u64,
    },
    ListStreams,
    ExtractStream {
        input: Arc<AcquiredFile>,
        index: u32,
        format: ExtractFormat,
    },
}

enum JobOutput {
    Artifact { file: TempPath, file_name: String },
    Acquired(AcquiredFile),
    Text(String),
    /// The job's files now belong to a session and must survive the sweep.
    Retained(String),
}

pub struct Orchestrator {
    config: Arc<AppConfig>,
    sessions: SessionStore,
    registry: Arc<JobRegistry>,
    preferences: PreferenceStore,
    /// In-flight quality listings, keyed by user, with their session token.
    listings: DashMap<String, (String, CancellationToken)>,
    acquirer: Arc<Acquirer>,
    engine: Arc<TranscodeEngine>,
    transport: Arc<dyn Transport>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AppConfig>,
        acquirer: Arc<Acquirer>,
        engine: Arc<TranscodeEngine>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            sessions: SessionStore::new(),
            registry: Arc::new(JobRegistry::new()),
            preferences: PreferenceStore::new(),
            listings: DashMap::new(),
            acquirer,
            engine,
            transport,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn preferences(&self) -> &PreferenceStore {
        &self.preferences
    }

    /// A new source replaces whatever the user was doing.
    pub fn on_new_source(&self, user: &str, source: Source) -> Response {
        let (token, replaced) = self.sessions.begin(user, source.clone());
        self.stop_listing(user);
        if replaced.is_some() {
            debug!(user, "Previous session replaced by new source");
        }
        Response::Prompt(operations_menu(&source, &token))
    }

    /// Classify pasted text and start a session for it.
    pub fn on_link(&self, user: &str, text: &str) -> Result<Response> {
        let source = classify_link(text)?;
        Ok(self.on_new_source(user, source))
    }

    pub async fn on_operation_chosen(
        self: &Arc<Self>,
        user: &str,
        op: JobKind,
        token: Option<&str>,
    ) -> Result<Response> {
        match self.sessions.choose(user, op, token)? {
            Choice::Await(phase) => Ok(Response::Prompt(phase_prompt(phase))),
            Choice::Execute(state) => {
                let pipeline = match op {
                    JobKind::MediaInfo => Pipeline::Info,
                    JobKind::StreamExtract => Pipeline::ListStreams,
                    _ => Pipeline::Download {
                        format: None,
                        title: None,
                    },
                };
                self.spawn_job(user, op, state.source, pipeline)
            }
            Choice::ListFormats { token, address } => {
                let cancel = CancellationToken::new();
                if let Some((_, previous)) = self
                    .listings
                    .insert(user.to_string(), (token.clone(), cancel.clone()))
                {
                    previous.cancel();
                }
                let listing = self
                    .acquirer
                    .extractor()
                    .list_formats(&address, &cancel)
                    .await;
                self.listings.remove_if(user, |_, (owner, _)| *owner == token);
                let listing = listing?;
                let menu = formats_menu(&listing.formats, &token);
                self.sessions
                    .offer_formats(user, &token, listing.formats, listing.title)?;
                Ok(Response::Prompt(menu))
            }
        }
    }

    pub async fn on_parameter(
        self: &Arc<Self>,
        user: &str,
        parameter: Parameter,
        token: Option<&str>,
    ) -> Result<Response> {
        match parameter {
            Parameter::SubtitleUpload { file_ref, name, size } => {
                let peeked = self.peek(user, Phase::AwaitingSubtitle, token)?;
                if !is_subtitle_extension(&extension_of(&name)) {
                    return Err(Error::unsupported(format!("'{name}' is not a subtitle file")));
                }
                if size > SUBTITLE_URL_LIMIT {
                    return Err(Error::TooLarge {
                        limit: SUBTITLE_URL_LIMIT,
                        actual: size,
                    });
                }
                let state = self.sessions.take(user, Some(Phase::AwaitingSubtitle), Some(peeked.token.as_str()))?;
                let subtitle = SubtitleSource::Upload { file_ref, name };
                self.spawn_job(user, JobKind::SubtitleBurn, state.source, Pipeline::BurnSubtitles(subtitle))
            }
            Parameter::SubtitleUrl(link) => {
                let peeked = self.peek(user, Phase::AwaitingSubtitle, token)?;
                let url = Url::parse(link.trim()).map_err(|_| Error::unsupported("not a subtitle link"))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(Error::unsupported("subtitle links must be http(s)"));
                }
                let state = self.sessions.take(user, Some(Phase::AwaitingSubtitle), Some(peeked.token.as_str()))?;
                let subtitle = SubtitleSource::Url(url.to_string());
                self.spawn_job(user, JobKind::SubtitleBurn, state.source, Pipeline::BurnSubtitles(subtitle))
            }
            Parameter::Resolution(text) => {
                let peeked = self.peek(user, Phase::AwaitingResolution, token)?;
                let dims = TargetDims::parse(&text)?;
                let state = self.sessions.take(user, Some(Phase::AwaitingResolution), Some(peeked.token.as_str()))?;
                self.spawn_job(user, JobKind::ResolutionChange, state.source, Pipeline::Resolution(dims))
            }
            Parameter::CompressTarget(text) => {
                let peeked = self.peek(user, Phase::AwaitingCompressTarget, token)?;
                let megabytes = parse_target_mb(&text)?;
                let state = self
                    .sessions
                    .take(user, Some(Phase::AwaitingCompressTarget), Some(peeked.token.as_str()))?;
                self.spawn_job(
                    user,
                    JobKind::Compress,
                    state.source,
                    Pipeline::Compress {
                        target_bytes: megabytes * MIB,
                    },
                )
            }
            Parameter::Format(choice) => {
                let peeked = self.peek(user, Phase::AwaitingFormat, token)?;
                let option = choice
                    .checked_sub(1)
                    .and_then(|i| peeked.scratch.formats.get(i))
                    .cloned()
                    .ok_or_else(|| Error::unsupported(format!("no quality option {choice}")))?;
                let state = self.sessions.take(user, Some(Phase::AwaitingFormat), Some(peeked.token.as_str()))?;
                self.spawn_job(
                    user,
                    JobKind::AcquireOnly,
                    state.source,
                    Pipeline::Download {
                        format: Some(option.selector),
                        title: state.scratch.title,
                    },
                )
            }
            Parameter::Stream { index, format } => {
                let peeked = self.peek(user, Phase::AwaitingStream, token)?;
                let stream = peeked
                    .scratch
                    .streams
                    .iter()
                    .find(|s| s.index == index)
                    .ok_or_else(|| Error::unsupported(format!("no stream #{index}")))?;
                let format = ExtractFormat::from_str(&format)
                    .map_err(|_| Error::unsupported(format!("format '{format}'")))?;
                if format.stream_kind() != stream.kind {
                    return Err(Error::unsupported(format!(
                        "{} stream #{index} cannot be saved as {format}",
                        stream.kind
                    )));
                }
                let state = self.sessions.take(user, Some(Phase::AwaitingStream), Some(peeked.token.as_str()))?;
                let input = state.scratch.cached_input.ok_or(Error::SessionExpired)?;
                self.spawn_job(
                    user,
                    JobKind::StreamExtract,
                    state.source,
                    Pipeline::ExtractStream { input, index, format },
                )
            }
        }
    }

    /// Clear the user's session and cancel everything they have running.
    pub fn on_cancel(&self, user: &str) -> Response {
        let had_session = self.sessions.clear(user).is_some() | self.stop_listing(user);
        let cancelled = self.registry.cancel_owned_by(user);
        info!(user, jobs = cancelled.len(), had_session, "User cancelled");
        let text = match (cancelled.len(), had_session) {
            (0, false) => "Nothing to cancel.".to_string(),
            (0, true) => "Cancelled.".to_string(),
            (n, _) => format!("Cancelled {n} running job(s)."),
        };
        Response::Prompt(text)
    }

    /// Abort the user's running quality listing, if any.
    fn stop_listing(&self, user: &str) -> bool {
        match self.listings.remove(user) {
            Some((_, (_, cancel))) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// All jobs for the admin, otherwise the requester's own.
    pub fn list_jobs(&self, requester: &str) -> Vec<JobInfo> {
        if self.config.is_admin(requester) {
            self.registry.list_all()
        } else {
            self.registry.list_for_owner(requester)
        }
    }

    pub fn render_jobs(&self, requester: &str) -> String {
        let jobs = self.list_jobs(requester);
        if jobs.is_empty() {
            return "No running jobs.".to_string();
        }
        let now = chrono::Utc::now();
        let mut out = format!("{} running job(s):", jobs.len());
        for job in jobs {
            let elapsed = (now - job.started_at).to_std().unwrap_or_default();
            let _ = write!(
                out,
                "\n  {} [{}] {} - {} ({})",
                job.id,
                job.kind,
                job.description,
                job.status,
                format_elapsed(elapsed)
            );
            if self.config.is_admin(requester) {
                let _ = write!(out, " by {}", job.owner);
            }
        }
        out
    }

    /// Cancel one job. Owners may cancel their own jobs, the admin any job.
    pub fn cancel_job(&self, requester: &str, id: &JobId) -> Result<bool> {
        let Some(job) = self.registry.get(id) else {
            return Ok(false);
        };
        if job.owner != requester && !self.config.is_admin(requester) {
            return Err(Error::Other("You can only cancel your own jobs".to_string()));
        }
        Ok(self.registry.cancel(id))
    }

    pub fn set_quality(&self, user: &str, text: &str) -> Result<Response> {
        if matches!(text.trim(), "" | "auto" | "default") {
            self.preferences.clear(user);
            return Ok(Response::Prompt("Quality reset to automatic encoder selection.".to_string()));
        }
        let pref = self.preferences.set_from_text(user, text)?;
        Ok(Response::Prompt(format!(
            "Quality set: libx264 preset {} crf {}",
            pref.preset, pref.crf
        )))
    }

    fn peek(&self, user: &str, phase: Phase, token: Option<&str>) -> Result<SessionState> {
        let state = self.sessions.get(user).ok_or(Error::SessionExpired)?;
        if token.is_some_and(|t| t != state.token) {
            return Err(Error::SessionExpired);
        }
        if state.phase != phase {
            return Err(Error::UnexpectedInput {
                expected: state.phase.expects().to_string(),
            });
        }
        Ok(state)
    }

    fn spawn_job(
        self: &Arc<Self>,
        user: &str,
        kind: JobKind,
        source: Source,
        pipeline: Pipeline,
    ) -> Result<Response> {
        let id = JobId::generate();
        let description = format!("{} {}", kind.label(), source.display_name());
        self.registry.register(id.clone(), user, kind, &description)?;

        let cancel = CancellationToken::new();
        self.registry.attach_cancellation(&id, cancel.clone());

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let reporter = ProgressReporter::new(id.to_string(), Stage::Downloading, self.config.progress_interval, tx);
        let ctx = JobContext::new(
            id.clone(),
            JobPaths::new(&self.config.temp_dir, id.as_str()),
            reporter,
            cancel,
        )
        .with_preference(self.preferences.get(user));

        let this = Arc::clone(self);
        let owner = user.to_string();
        let handle = tokio::spawn(async move {
            this.run_job(owner, kind, source, pipeline, ctx, rx).await;
        });
        Ok(Response::Started { job_id: id, handle })
    }

    async fn run_job(
        self: Arc<Self>,
        user: String,
        kind: JobKind,
        source: Source,
        pipeline: Pipeline,
        ctx: JobContext,
        rx: mpsc::Receiver<ProgressUpdate>,
    ) {
        let guard = JobGuard::new(Arc::clone(&self.registry), ctx.id.clone());
        let id = ctx.id.clone();
        let root = ctx.paths.root().to_path_buf();
        let started = Instant::now();
        let forwarder = self.spawn_forwarder(user.clone(), rx);

        info!(job_id = %id, %kind, source = source.kind_label(), "Job started");
        self.transport
            .render(&user, &format!("Job {id} started: {} of {}", kind.label(), source.display_name()))
            .await;

        let outcome = self.execute(&user, &source, pipeline, &ctx).await;
        drop(ctx);
        // All senders are gone; flush what is left before the final message.
        let _ = forwarder.await;
        let elapsed = started.elapsed();

        let mut retained = false;
        match outcome {
            Ok(JobOutput::Artifact { file, file_name }) => {
                self.deliver(&user, &id, file.path(), file_name, elapsed).await;
            }
            Ok(JobOutput::Acquired(input)) => {
                let name = sanitize_filename(input.original_name());
                self.deliver(&user, &id, input.path(), name, elapsed).await;
            }
            Ok(JobOutput::Text(text)) => self.transport.render(&user, &text).await,
            Ok(JobOutput::Retained(text)) => {
                retained = true;
                self.transport.render(&user, &text).await;
            }
            Err(Error::Cancelled) => {
                info!(job_id = %id, "Job cancelled");
                self.transport.render(&user, &format!("Job {id} cancelled.")).await;
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "Job failed");
                self.transport
                    .render(&user, &format!("Job {id} failed: {}", e.user_message()))
                    .await;
            }
        }

        drop(guard);
        if !retained {
            purge_job_files(&root, id.as_str()).await;
        }
        info!(job_id = %id, elapsed = %format_elapsed(elapsed), "Job finished");
    }

    async fn deliver(&self, user: &str, id: &JobId, path: &Path, file_name: String, elapsed: Duration) {
        let size = match file_size(path).await {
            Ok(size) => size,
            Err(e) => {
                warn!(job_id = %id, error = %e, "Output missing");
                self.transport
                    .render(user, &format!("Job {id} failed: {}", e.user_message()))
                    .await;
                return;
            }
        };
        let artifact = Artifact {
            job_id: id.clone(),
            path: path.to_path_buf(),
            file_name,
            size,
            elapsed,
        };
        if let Err(e) = self.transport.deliver(user, artifact).await {
            warn!(job_id = %id, error = %e, "Delivery failed");
            self.transport
                .render(user, &format!("Job {id} finished but delivery failed: {}", e.user_message()))
                .await;
        }
    }

    fn spawn_forwarder(&self, user: String, mut rx: mpsc::Receiver<ProgressUpdate>) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                let id = JobId::from(update.job_id.as_str());
                registry.update_status(&id, format!("{} {}%", update.event.stage, update.event.percent));
                transport.render(&user, &render_progress(&id, &update.event)).await;
            }
        })
    }

    async fn execute(
        &self,
        user: &str,
        source: &Source,
        pipeline: Pipeline,
        ctx: &JobContext,
    ) -> Result<JobOutput> {
        ensure_dir_all(ctx.paths.root()).await?;

        match pipeline {
            Pipeline::Download { format, title } => {
                let mut request = AcquireRequest::new(source).with_title(title);
                if let Some(selector) = format {
                    request = request.with_format(selector);
                }
                let input = self.acquirer.acquire(request, ctx).await?;
                Ok(JobOutput::Acquired(input))
            }
            Pipeline::Info => {
                let input = self.acquirer.acquire(AcquireRequest::new(source), ctx).await?;
                let info = self.engine.probe_media_info(ctx, input.path()).await?;
                Ok(JobOutput::Text(format!(
                    "Media info for {}:\n{}",
                    input.original_name(),
                    info.report()
                )))
            }
            Pipeline::BurnSubtitles(subtitle) => {
                let input = self.acquirer.acquire(AcquireRequest::new(source), ctx).await?;
                let subs = self.fetch_subtitle(&subtitle, ctx).await?;
                let output = self.engine.burn_subtitles(ctx, input.path(), subs.path()).await?;
                Ok(JobOutput::Artifact {
                    file: output,
                    file_name: output_filename(input.original_name(), "subtitled", "mp4"),
                })
            }
            Pipeline::Resolution(dims) => {
                let input = self.acquirer.acquire(AcquireRequest::new(source), ctx).await?;
                let output = self.engine.change_resolution(ctx, input.path(), dims).await?;
                let suffix = dims.label().map(str::to_string).unwrap_or_else(|| dims.to_string());
                Ok(JobOutput::Artifact {
                    file: output,
                    file_name: output_filename(input.original_name(), &suffix, "mp4"),
                })
            }
            Pipeline::Compress { target_bytes } => {
                let input = self.acquirer.acquire(AcquireRequest::new(source), ctx).await?;
                let output = self
                    .engine
                    .compress_to_size(ctx, input.path(), target_bytes)
                    .await?;
                Ok(JobOutput::Artifact {
                    file: output,
                    file_name: output_filename(input.original_name(), "compressed", "mp4"),
                })
            }
            Pipeline::ListStreams => {
                let input = self.acquirer.acquire(AcquireRequest::new(source), ctx).await?;
                let info = self.engine.probe_media_info(ctx, input.path()).await?;
                let streams = info.extractable_streams();
                if streams.is_empty() {
                    return Ok(JobOutput::Text(
                        "No audio or subtitle streams to extract.".to_string(),
                    ));
                }
                let menu_streams = streams.clone();
                match self
                    .sessions
                    .await_stream_choice(user, source.clone(), Arc::new(input), streams)
                {
                    Some(token) => Ok(JobOutput::Retained(streams_menu(&menu_streams, &token))),
                    None => Ok(JobOutput::Text(
                        "Streams listed, but a newer source replaced this request.".to_string(),
                    )),
                }
            }
            Pipeline::ExtractStream { input, index, format } => {
                let output = self
                    .engine
                    .extract_stream(ctx, input.path(), index, format)
                    .await?;
                Ok(JobOutput::Artifact {
                    file: output,
                    file_name: output_filename(
                        input.original_name(),
                        &format!("stream{index}"),
                        format.extension(),
                    ),
                })
            }
        }
    }

    async fn fetch_subtitle(&self, subtitle: &SubtitleSource, ctx: &JobContext) -> Result<TempPath> {
        match subtitle {
            SubtitleSource::Upload { file_ref, name } => {
                let dest = TempPath::new(ctx.paths.file("subsrc", &extension_of(name)));
                self.acquirer
                    .uploads()
                    .fetch(file_ref, dest.path(), &ProgressReporter::noop(), &ctx.cancel)
                    .await?;
                Ok(dest)
            }
            SubtitleSource::Url(link) => {
                let bytes = self
                    .acquirer
                    .http()
                    .fetch_small(link, SUBTITLE_URL_LIMIT, &ctx.cancel)
                    .await?;
                let ext = Url::parse(link)
                    .ok()
                    .map(|u| extension_of(u.path()))
                    .filter(|e| is_subtitle_extension(e))
                    .unwrap_or_else(|| ".srt".to_string());
                let dest = TempPath::new(ctx.paths.file("subsrc", &ext));
                tokio::fs::write(dest.path(), bytes)
                    .await
                    .map_err(|e| Error::io_path("writing", dest.path(), e))?;
                Ok(dest)
            }
        }
    }
}

fn parse_target_mb(text: &str) -> Result<u64> {
    let trimmed = text.trim().trim_end_matches(|c: char| c.is_ascii_alphabetic()).trim();
    let megabytes: u64 = trimmed
        .parse()
        .map_err(|_| Error::unsupported(format!("'{}' is not a size in MB", text.trim())))?;
    if !COMPRESS_TARGET_MB.contains(&megabytes) {
        return Err(Error::unsupported(format!(
            "target must be between {} and {} MB",
            COMPRESS_TARGET_MB.start(),
            COMPRESS_TARGET_MB.end()
        )));
    }
    Ok(megabytes)
}

fn operations_menu(source: &Source, token: &str) -> String {
    let mut out = format!(
        "Got {}: {}\nChoose an operation (session {token}):",
        source.kind_label(),
        source.display_name()
    );
    for kind in JobKind::iter() {
        let _ = write!(out, "\n  {kind} - {}", kind.label());
    }
    out
}

fn phase_prompt(phase: Phase) -> String {
    match phase {
        Phase::AwaitingResolution => {
            let presets: Vec<&str> = RESOLUTION_PRESETS.iter().map(|(label, _, _)| *label).collect();
            format!("Send a resolution: {} or WIDTHxHEIGHT", presets.join(", "))
        }
        Phase::AwaitingCompressTarget => format!(
            "Send the target size in MB ({}-{})",
            COMPRESS_TARGET_MB.start(),
            COMPRESS_TARGET_MB.end()
        ),
        other => format!("Send {}", other.expects()),
    }
}

fn formats_menu(formats: &[FormatOption], token: &str) -> String {
    let mut out = format!("Choose a quality (session {token}):");
    for (i, option) in formats.iter().enumerate() {
        let _ = write!(out, "\n  {}. {}", i + 1, option.label);
        if let Some(size) = option.estimated_size {
            let _ = write!(out, " (~{})", format_size(size));
        }
    }
    out
}

fn streams_menu(streams: &[StreamInfo], token: &str) -> String {
    let mut out = format!("Choose a stream and format (session {token}):");
    for stream in streams {
        let formats: Vec<String> = ExtractFormat::available_for(stream.kind)
            .iter()
            .map(ToString::to_string)
            .collect();
        let _ = write!(out, "\n  {} -> {}", stream.summary(), formats.join(", "));
    }
    out
}

/// Progress message for one event.
pub fn render_progress(id: &JobId, event: &ProgressEvent) -> String {
    let mut out = format!(
        "Job {id} - {}\n{} {}%",
        event.stage,
        progress_bar(event.percent),
        event.percent
    );
    if !event.throughput.is_empty() {
        let _ = write!(out, "\nSpeed: {}", event.throughput);
    }
    if !event.eta.is_empty() && event.percent < 100 {
        let _ = write!(out, " | ETA: {}", event.eta);
    }
    if let Some(detail) = &event.detail {
        let _ = write!(out, "\n{detail}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_mb() {
        assert_eq!(parse_target_mb("50").unwrap(), 50);
        assert_eq!(parse_target_mb(" 25 MB ").unwrap(), 25);
        assert!(parse_target_mb("0").is_err());
        assert!(parse_target_mb("5000").is_err());
        assert!(parse_target_mb("ten").is_err());
    }

    #[test]
    fn test_render_progress() {
        let event = ProgressEvent::new(Stage::Processing, 45, "1.75x", "1m 5s");
        let text = render_progress(&JobId::from("ab12cd34"), &event);
        assert!(text.starts_with("Job ab12cd34 - Processing"));
        assert!(text.contains("[█████████░░░░░░░░░░░] 45%"));
        assert!(text.contains("Speed: 1.75x | ETA: 1m 5s"));
    }

    #[test]
    fn test_menus() {
        let source = Source::Url {
            address: "https://example.com/clip.mp4".to_string(),
        };
        let menu = operations_menu(&source, "tok123");
        assert!(menu.contains("clip.mp4"));
        assert!(menu.contains("session tok123"));
        assert!(menu.contains("compress - Compress"));

        let formats = formats_menu(
            &[FormatOption::best(), FormatOption::for_height(720, Some(3 * MIB))],
            "t",
        );
        assert!(formats.contains("1. Best quality"));
        assert!(formats.contains("2. 720p (~3.0 MB)"));

        assert!(phase_prompt(Phase::AwaitingResolution).contains("720p"));
        assert!(phase_prompt(Phase::AwaitingCompressTarget).contains("1-4096"));
    }
}
