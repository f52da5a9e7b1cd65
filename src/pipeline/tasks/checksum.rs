use crate::pipeline::{Job, JobError, PipelineTask, TaskContext};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use tracing::debug;

const BUFFER_SIZE: usize = 64 * 1024;

/// Hashes every input file with SHA-256.
///
/// Usually declared as a split step, so each child job hashes one file.
pub struct ChecksumTask;

impl ChecksumTask {
    fn hash_file(ctx: &TaskContext, path: &str) -> Result<String, JobError> {
        let mut file = File::open(path)
            .map_err(|e| JobError::ExecutionFailed(format!("Cannot open {}: {}", path, e)))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            ctx.check_cancelled()?;
            let read = file
                .read(&mut buffer)
                .map_err(|e| JobError::ExecutionFailed(format!("Cannot read {}: {}", path, e)))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
        Ok(format!("sha256:{:x}", hasher.finalize()))
    }
}

impl PipelineTask for ChecksumTask {
    fn id(&self) -> &'static str {
        "checksum"
    }

    fn description(&self) -> &'static str {
        "Computes a SHA-256 checksum for each input file"
    }

    fn execute(&self, ctx: &TaskContext, job: &mut Job) -> Result<(), JobError> {
        for input in job.inputs.clone() {
            let checksum = Self::hash_file(ctx, &input)?;
            debug!("Job {}: {} -> {}", job.guid, input, checksum);
            job.results.push(json!({ "input": input, "checksum": checksum }));
        }
        Ok(())
    }
}
