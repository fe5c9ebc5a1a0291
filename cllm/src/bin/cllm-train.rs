//! Thin CLI entry point: parse arguments into a `Config`, load a token stream and model
//! dimensions, and hand everything to `cllm::execute`.

use std::io::Read;
use std::process::ExitCode;

use cllm::{cli, execute, metrics::MetricsRegistry, modelfile::ModelFile, ops::ModelDims, reference_ops::EmbeddingPullOps, CllmError, ExecuteArgs};
use cllm_queues::Running;

/// Exit codes follow the error's severity: malformed input and I/O failures are
/// operator-fixable (2), resource exhaustion is environment-fixable (3), and anything
/// that indicates a runtime bug in the core itself aborts hard (1).
fn exit_code_for(err: &CllmError) -> ExitCode {
    match err {
        CllmError::MalformedInput(_) => ExitCode::from(2),
        CllmError::OutOfMemory(_) => ExitCode::from(3),
        CllmError::NumericAnomaly { .. } => ExitCode::from(2),
        CllmError::DivergenceDetected { .. } => ExitCode::from(4),
        CllmError::InvariantViolation(_) => ExitCode::from(1),
        CllmError::Interrupted => ExitCode::SUCCESS,
    }
}

fn load_token_stream(path: &str) -> Result<Vec<u32>, CllmError> {
    let mut file = std::fs::File::open(path).map_err(|e| CllmError::MalformedInput(format!("cannot open token stream {path}: {e}")))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).map_err(|e| CllmError::MalformedInput(format!("cannot read token stream {path}: {e}")))?;
    if bytes.len() % 4 != 0 {
        return Err(CllmError::MalformedInput(format!("token stream {path} length {} is not a multiple of 4", bytes.len())));
    }
    Ok(bytes.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect())
}

fn run() -> Result<(), CllmError> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = cli::from_args(args.into_iter())?;

    let dims = ModelDims {
        vocab_size: 32_000,
        embedding_dim: 512,
        num_layers: 6,
        num_heads: 8,
        ff_hidden_dim: 2048,
        context_length: config.training.sequence_length,
        symmetry_order: config.runtime.symmetry_order,
    };

    let token_stream_path = std::env::var("CLLM_TOKEN_STREAM").map_err(|_| CllmError::MalformedInput("CLLM_TOKEN_STREAM env var not set".into()))?;
    let token_stream = load_token_stream(&token_stream_path)?;

    let params = match std::env::var("CLLM_RESUME_FROM") {
        Ok(path) => {
            let mut file = std::fs::File::open(&path).map_err(|e| CllmError::MalformedInput(format!("cannot open checkpoint {path}: {e}")))?;
            ModelFile::read(&mut file, config.runtime.symmetry_order)?.params
        }
        Err(_) => dims.init_params(config.runtime.seed),
    };

    let ops = EmbeddingPullOps::new(dims);
    let metrics = MetricsRegistry::new(true);
    let running = Running::default();

    let save_path = std::env::var("CLLM_CHECKPOINT_OUT").ok();
    let mut writer = save_path.map(|path| {
        let closure: Box<dyn FnMut(&ModelFile, &cllm::modelfile::OptimizerCheckpoint) -> Result<(), CllmError>> = Box::new(move |model, _checkpoint| {
            let mut file = std::fs::File::create(&path).map_err(|e| CllmError::MalformedInput(format!("cannot write checkpoint {path}: {e}")))?;
            model.write(&mut file)
        });
        closure
    });

    let report = execute(&config, ExecuteArgs { dims, token_stream, ops: &ops, params }, metrics, running, writer.as_deref_mut())?;

    eprintln!("[cllm] finished {} epochs, final loss {:.6}, {} parameters", report.epochs_completed, report.final_loss, report.params.len());
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("[cllm] fatal: {err}");
            exit_code_for(&err)
        }
    }
}
