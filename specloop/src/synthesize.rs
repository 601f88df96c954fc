//! Correction synthesis: one failure analysis in, one narrowly targeted plan out.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::core::anchors::{AnchorSpan, AnchoredDocument, Lookup, contains_heading};
use crate::core::types::{CorrectionError, CorrectionPlan, ErrorAnalysis};
use crate::graph::Task;
use crate::io::prompt::PromptEngine;
use crate::io::reasoner::{ProposalRequest, Reasoner};

pub struct CorrectionSynthesizer<R> {
    reasoner: R,
    prompts: PromptEngine,
}

impl<R: Reasoner> CorrectionSynthesizer<R> {
    pub fn new(reasoner: R) -> Result<Self> {
        Ok(Self {
            reasoner,
            prompts: PromptEngine::new()?,
        })
    }

    pub fn reasoner(&self) -> &R {
        &self.reasoner
    }

    /// Build a plan that rewrites exactly one anchored section of `document`.
    #[instrument(skip_all, fields(task = %task.id, attempt = attempt))]
    pub fn synthesize(
        &self,
        analysis: &ErrorAnalysis,
        task: &Task,
        document_id: &str,
        document: &AnchoredDocument,
        attempt: u32,
    ) -> Result<CorrectionPlan, CorrectionError> {
        let span = choose_target(analysis, task, document)?;
        let current_body = document.body(span);
        debug!(anchor = %span.id, "correction target chosen");

        let prompt = self
            .prompts
            .render_correction(task, &span.id, current_body, analysis, attempt)
            .map_err(|err| CorrectionError::NoSafeTarget(format!("render prompt: {err:#}")))?;
        let proposal = self
            .reasoner
            .propose(&ProposalRequest {
                task_id: &task.id,
                anchor: &span.id,
                current_body,
                analysis,
                attempt,
                prompt: &prompt,
            })
            .map_err(|err| {
                warn!(err = %format!("{err:#}"), "reasoner produced no proposal");
                CorrectionError::NoSafeTarget(format!("no proposal for '{}': {err:#}", span.id))
            })?;

        if proposal.replacement.trim().is_empty() {
            return Err(CorrectionError::NoSafeTarget(format!(
                "proposal for '{}' is empty",
                span.id
            )));
        }
        if proposal.replacement == current_body {
            return Err(CorrectionError::NoSafeTarget(format!(
                "proposal for '{}' does not change it",
                span.id
            )));
        }
        if contains_heading(&proposal.replacement) {
            return Err(CorrectionError::NoSafeTarget(format!(
                "proposal for '{}' adds a heading",
                span.id
            )));
        }

        let mut rationale = format!(
            "{} on attempt {attempt}: {}",
            analysis.kind, analysis.root_cause
        );
        if let Some(notes) = proposal.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
            rationale.push_str(" (");
            rationale.push_str(notes);
            rationale.push(')');
        }
        info!(anchor = %span.id, "correction synthesized");
        Ok(CorrectionPlan {
            document: document_id.to_string(),
            anchor: span.id.clone(),
            replacement: proposal.replacement,
            rationale,
            analysis: analysis.clone(),
        })
    }
}

/// The anchor a correction for `task` should rewrite.
///
/// The implicated reference wins when the task declares it and the document
/// holds it exactly once; otherwise the task's own section. Missing or
/// ambiguous candidates are skipped.
pub fn choose_target<'d>(
    analysis: &ErrorAnalysis,
    task: &Task,
    document: &'d AnchoredDocument,
) -> Result<&'d AnchorSpan, CorrectionError> {
    let implicated = analysis
        .implicated
        .as_deref()
        .filter(|id| task.references.iter().any(|reference| reference == id));
    let candidates = implicated.into_iter().chain(std::iter::once(task.id.as_str()));

    let mut skipped = Vec::new();
    for candidate in candidates {
        match document.lookup(candidate) {
            Lookup::Found(span) => return Ok(span),
            Lookup::Missing => skipped.push(format!("'{candidate}' missing")),
            Lookup::Ambiguous(count) => skipped.push(format!("'{candidate}' appears {count} times")),
        }
    }
    Err(CorrectionError::NoSafeTarget(format!(
        "no unique anchor for task '{}': {}",
        task.id,
        skipped.join(", ")
    )))
}
