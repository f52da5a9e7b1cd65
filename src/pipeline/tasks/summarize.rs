use crate::pipeline::{Job, JobError, PipelineTask, TaskContext};
use serde_json::json;

/// Appends a summary of the results gathered so far.
///
/// When the job has a `summary_path` parameter the summary is also written
/// there as JSON.
pub struct SummarizeTask;

impl PipelineTask for SummarizeTask {
    fn id(&self) -> &'static str {
        "summarize"
    }

    fn description(&self) -> &'static str {
        "Summarizes the results produced by earlier steps"
    }

    fn execute(&self, ctx: &TaskContext, job: &mut Job) -> Result<(), JobError> {
        ctx.check_cancelled()?;
        let summary = json!({
            "summary": {
                "job": job.guid,
                "inputs": job.inputs.len(),
                "results": job.results.len(),
            }
        });

        if let Some(path) = job.parameters.get("summary_path").and_then(|v| v.as_str()) {
            let body = serde_json::to_vec_pretty(&json!({
                "summary": summary["summary"],
                "results": job.results,
            }))
            .map_err(|e| JobError::ExecutionFailed(format!("Cannot encode summary: {}", e)))?;
            std::fs::write(path, body).map_err(|e| {
                JobError::ExecutionFailed(format!("Cannot write summary to {}: {}", path, e))
            })?;
        }

        job.results.push(summary);
        Ok(())
    }
}
