//! Job payload and the closed set of processing modes.
//!
//! The API layer used to dispatch on a free-form mode string; here the
//! set is a closed enum resolved once at the boundary, so every handler
//! site is exhaustively checked. The serde renames preserve the wire
//! strings the frontend already sends.

use serde::{Deserialize, Serialize};

/// The processing path a job takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobMode {
    #[serde(rename = "Detailed Idea Description")]
    DetailedIdeaDescription,
    #[serde(rename = "Reference-Based Ideation")]
    ReferenceBasedIdeation,
    #[serde(rename = "Idea Spark")]
    IdeaSpark,
    #[serde(rename = "Deep Survey")]
    DeepSurvey,
    #[serde(rename = "Auto Experiment")]
    AutoExperiment,
    #[serde(rename = "Paper Generation Agent")]
    PaperGeneration,
}

impl JobMode {
    /// Research modes automatically submit a paper-generation follow-up
    /// job when they succeed. `PaperGeneration` itself never chains,
    /// which is what terminates the chain.
    pub fn chains_paper_generation(self) -> bool {
        !matches!(self, JobMode::PaperGeneration)
    }
}

/// Caller-supplied input for one job. Immutable after submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub question: String,
    /// Optional reference material (paper abstract, URL, ...).
    #[serde(default)]
    pub reference: Option<String>,
    pub mode: JobMode,
}
