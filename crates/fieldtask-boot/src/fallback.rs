//! Pre-render failure fallback
//!
//! Catches failures that happen before the UI host starts rendering and
//! shows a minimal, dependency-free error surface with reload and
//! copy-diagnostics actions. Once rendering has started, failures are only
//! logged; the host's own error views take over.
//!
//! A failure raised between host startup and [`PreRenderFallback::mark_render_started`]
//! is still treated as pre-render. Hosts should mark as early as possible.

use crate::classify::{classify_at, stage};
use crate::context::{BootContext, BootDiagnostics, STAGE_PRE_RENDER_READY};
use fieldtask_model::Failure;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Fallback receiving panics from the process-wide hook
static ACTIVE: RwLock<Option<Weak<PreRenderFallback>>> = RwLock::new(None);

/// How the failure surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// Panic or synchronous error
    UncaughtError,
    /// Failed background future nobody awaited
    UnhandledRejection,
}

impl FailureKind {
    /// Stable label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UncaughtError => "uncaught-error",
            Self::UnhandledRejection => "unhandled-rejection",
        }
    }
}

/// What happened to a reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// Error surface rendered
    Rendered,
    /// Rendering had started; logged only
    Logged,
    /// Surface already rendered once; logged only
    Suppressed,
}

/// Content of the fallback error surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackReport {
    /// How the failure surfaced
    pub kind: FailureKind,
    /// Sanitized message
    pub message: String,
    /// Diagnostics offered for copying
    pub diagnostics: BootDiagnostics,
}

impl FallbackReport {
    /// Plain text rendering
    #[must_use]
    pub fn to_text(&self) -> String {
        format!(
            "Fieldtask failed to start\n\n{}\n\nStage: {}\nBuild: {}\n\n[Reload]  [Copy diagnostics]\n",
            self.message, self.diagnostics.stage, self.diagnostics.build_marker
        )
    }

    /// Self-contained HTML page
    #[must_use]
    pub fn to_html(&self) -> String {
        let payload = escape_html(&self.diagnostics.clipboard_payload());
        format!(
            r#"<!doctype html>
<html><head><meta charset="utf-8"><title>Fieldtask failed to start</title></head>
<body style="font-family:sans-serif;max-width:40rem;margin:4rem auto;padding:0 1rem">
<h1>Fieldtask failed to start</h1>
<p>{message}</p>
<p>
<button onclick="location.reload()">Reload</button>
<button onclick="navigator.clipboard.writeText(document.getElementById('fieldtask-diagnostics').textContent)">Copy diagnostics</button>
</p>
<details><summary>Diagnostics</summary><pre id="fieldtask-diagnostics">{payload}</pre></details>
</body></html>
"#,
            message = escape_html(&self.message),
        )
    }
}

/// Where the fallback error surface is drawn
pub trait FallbackSurface: Send + Sync {
    /// Draw the surface
    fn render(&self, report: &FallbackReport);
}

/// Surface that writes the text rendering to stderr
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrSurface;

impl FallbackSurface for StderrSurface {
    fn render(&self, report: &FallbackReport) {
        eprintln!("{}", report.to_text());
    }
}

/// Safety net for failures before the UI host renders
pub struct PreRenderFallback {
    context: Arc<BootContext>,
    surface: Arc<dyn FallbackSurface>,
    render_started: AtomicBool,
    rendered: AtomicBool,
}

impl PreRenderFallback {
    /// Create fallback drawing on `surface`
    #[must_use]
    pub fn new(context: Arc<BootContext>, surface: Arc<dyn FallbackSurface>) -> Arc<Self> {
        Arc::new(Self {
            context,
            surface,
            render_started: AtomicBool::new(false),
            rendered: AtomicBool::new(false),
        })
    }

    /// Route panics to this fallback
    ///
    /// The process-wide hook is installed once and chains the previous
    /// hook; later calls only retarget it.
    pub fn install(self: &Arc<Self>) {
        *ACTIVE.write() = Some(Arc::downgrade(self));

        static INSTALLED: std::sync::Once = std::sync::Once::new();
        INSTALLED.call_once(|| {
            let previous = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |info| {
                let active = ACTIVE.read().as_ref().and_then(Weak::upgrade);
                if let Some(fallback) = active {
                    let mut text = panic_message(info.payload());
                    if let Some(location) = info.location() {
                        text = format!("{text} at {}:{}", location.file(), location.line());
                    }
                    fallback.report(&Failure::Text(text), FailureKind::UncaughtError);
                }
                previous(info);
            }));
        });
    }

    /// Host started rendering; from now on failures are only logged
    pub fn mark_render_started(&self) {
        if !self.render_started.swap(true, Ordering::AcqRel) {
            self.context.record_stage(STAGE_PRE_RENDER_READY);
        }
    }

    /// Whether the host started rendering
    #[must_use]
    pub fn is_render_started(&self) -> bool {
        self.render_started.load(Ordering::Acquire)
    }

    /// Whether the surface was drawn
    #[must_use]
    pub fn has_rendered(&self) -> bool {
        self.rendered.load(Ordering::Acquire)
    }

    /// Handle a failure caught by a global handler
    pub fn report(&self, failure: &Failure, kind: FailureKind) -> FallbackOutcome {
        let started = self.is_render_started();
        let at = if started { stage::RENDER } else { stage::PRE_RENDER };
        let classified = classify_at(failure, at);

        if started {
            error!(kind = kind.as_str(), category = %classified.category, detail = %classified.raw_detail, "failure after render start");
            return FallbackOutcome::Logged;
        }
        if self.rendered.swap(true, Ordering::AcqRel) {
            warn!(kind = kind.as_str(), category = %classified.category, "additional pre-render failure");
            return FallbackOutcome::Suppressed;
        }

        error!(kind = kind.as_str(), category = %classified.category, detail = %classified.raw_detail, "pre-render failure");
        let report = FallbackReport {
            kind,
            message: classified.user_message.clone(),
            diagnostics: self.context.diagnostics(Some(&classified)),
        };
        self.surface.render(&report);
        FallbackOutcome::Rendered
    }

    /// Spawn a background future whose failure or panic is reported here
    pub fn spawn<F, T>(self: &Arc<Self>, fut: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = Result<T, Failure>> + Send + 'static,
        T: Send + 'static,
    {
        let this = Arc::clone(self);
        let inner = tokio::spawn(fut);
        tokio::spawn(async move {
            match inner.await {
                Ok(Ok(value)) => Some(value),
                Ok(Err(raw)) => {
                    this.report(&raw, FailureKind::UnhandledRejection);
                    None
                }
                Err(join) if join.is_panic() => {
                    let text = panic_message(join.into_panic().as_ref());
                    this.report(&Failure::Text(text), FailureKind::UncaughtError);
                    None
                }
                Err(_) => None,
            }
        })
    }
}

impl std::fmt::Debug for PreRenderFallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreRenderFallback")
            .field("render_started", &self.is_render_started())
            .field("rendered", &self.has_rendered())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<unknown panic payload>".to_string()
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
