//! Avatar dispatch stage: hand each page's audio to the avatar, paced.
//!
//! Each push runs on its own tokio task so the loop never waits for playback.
//! The tasks are not detached: [`dispatch_pages`] returns their handles and
//! [`finish_dispatches`] either awaits them (normal completion) or aborts the
//! ones still running once the run stops, so every push ends up in the outcome
//! as delivered, failed or abandoned.

use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, PageError};
use crate::output::{DispatchReport, DispatchState, PageRecord};
use crate::state::{RunContext, Stage};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// The external avatar service.
#[async_trait]
pub trait AvatarSink: Send + Sync {
    /// Stream one audio file to the avatar instance `instance`.
    async fn push(&self, audio: &Path, instance: &str) -> Result<(), CollaboratorError>;
}

/// A push that has been issued but not yet collected.
#[derive(Debug)]
pub struct PendingDispatch {
    pub page_num: usize,
    pub audio_path: PathBuf,
    handle: JoinHandle<Result<(), CollaboratorError>>,
}

/// Issue a push for every page with audio, in page order, pausing
/// [`PipelineConfig::dispatch_delay`] between pages.
///
/// Checks for cancellation before each page; pages not reached are simply
/// not dispatched.
pub async fn dispatch_pages(
    ctx: &RunContext,
    pages: &[PageRecord],
    sink: Arc<dyn AvatarSink>,
    config: &PipelineConfig,
) -> Vec<PendingDispatch> {
    let ready: Vec<(usize, &PathBuf)> = pages
        .iter()
        .filter_map(|p| p.audio_path.as_ref().map(|a| (p.page_num, a)))
        .collect();
    let total = pages.len();
    info!(
        "Dispatching {} audio files to '{}' every {:?}",
        ready.len(),
        config.avatar_instance,
        config.dispatch_delay()
    );

    let mut pending = Vec::with_capacity(ready.len());
    for (i, &(page_num, audio_path)) in ready.iter().enumerate() {
        if i > 0 {
            sleep(config.dispatch_delay()).await;
        }
        if !ctx.should_continue() {
            info!("Run stopped before dispatching page {}", page_num);
            break;
        }

        let sink = Arc::clone(&sink);
        let path = audio_path.clone();
        let instance = config.avatar_instance.clone();
        let handle = tokio::spawn(async move { sink.push(&path, &instance).await });
        debug!("Page {}: push issued for {}", page_num, audio_path.display());

        pending.push(PendingDispatch {
            page_num,
            audio_path: audio_path.clone(),
            handle,
        });
        ctx.set_current_slide(page_num);
        if let Some(ref cb) = config.progress_callback {
            cb.on_page_dispatched(page_num, total);
        }
    }
    pending
}

/// Collect every pending push.
///
/// With `wait` set, each push is awaited until it completes or the run is
/// stopped, whichever comes first. Pushes still running when the run stops,
/// or every unfinished push when `wait` is unset, are aborted and reported
/// as abandoned.
pub async fn finish_dispatches(
    ctx: &RunContext,
    pending: Vec<PendingDispatch>,
    wait: bool,
    config: &PipelineConfig,
) -> Vec<DispatchReport> {
    let mut reports = Vec::with_capacity(pending.len());
    for mut p in pending {
        let joined = if p.handle.is_finished() {
            Some((&mut p.handle).await)
        } else if wait {
            tokio::select! {
                biased;
                res = &mut p.handle => Some(res),
                _ = ctx.stopped(config.poll_interval()) => None,
            }
        } else {
            None
        };
        let state = match joined {
            Some(Ok(Ok(()))) => DispatchState::Delivered,
            Some(Ok(Err(e))) => failed(p.page_num, e.to_string(), config),
            Some(Err(join)) if join.is_cancelled() => DispatchState::Abandoned,
            Some(Err(join)) => failed(p.page_num, format!("push task panicked: {join}"), config),
            None => {
                p.handle.abort();
                debug!("Page {}: in-flight push abandoned", p.page_num);
                DispatchState::Abandoned
            }
        };
        reports.push(DispatchReport {
            page_num: p.page_num,
            audio_path: p.audio_path,
            state,
        });
    }
    reports
}

fn failed(page: usize, detail: String, config: &PipelineConfig) -> DispatchState {
    let error = PageError::DispatchFailed { page, detail };
    warn!("{}", error);
    if let Some(ref cb) = config.progress_callback {
        cb.on_page_error(page, Stage::Dispatching, &error.to_string());
    }
    DispatchState::Failed { error }
}
