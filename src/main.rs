//! CodeBox runner.
//!
//! Executes code from a file argument (or stdin) in the configured backend
//! and prints the output as it streams in.
//!
//! ```text
//! codebox [--bash] [FILE]
//! ```

use std::io::{Read, Write};

use futures::StreamExt;

use codebox_core::telemetry::configure_tracing;
use codebox_core::{ChunkKind, CodeBoxConfig, KernelMode};
use codebox_sandbox::CodeBox;

struct Args {
    mode: KernelMode,
    file: Option<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        mode: KernelMode::Python,
        file: None,
    };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--bash" => args.mode = KernelMode::Bash,
            "--python" => args.mode = KernelMode::Python,
            "-h" | "--help" => {
                println!("usage: codebox [--bash|--python] [FILE]");
                std::process::exit(0);
            }
            flag if flag.starts_with("--") => anyhow::bail!("unknown option: {flag}"),
            path => args.file = Some(path.to_string()),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CodeBoxConfig::load()?;
    configure_tracing(std::env::var("CODEBOX_LOG_JSON").is_ok(), config.debug)?;
    let args = parse_args()?;

    let code = match &args.file {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => {
            let mut code = String::new();
            std::io::stdin().read_to_string(&mut code)?;
            code
        }
    };

    tracing::info!(backend = %config.backend_kind(), kernel = %args.mode, "Starting CodeBox v{}", env!("CARGO_PKG_VERSION"));
    let codebox = CodeBox::new(config)?;

    let run = async {
        let mut stream = codebox.stream_execute(&code, args.mode).await?;
        let mut failed = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            match chunk.kind {
                ChunkKind::Text => {
                    print!("{}", chunk.content);
                    std::io::stdout().flush()?;
                }
                ChunkKind::Error => {
                    failed = true;
                    eprint!("{}", chunk.content);
                }
                ChunkKind::Image => {
                    println!("[image: {} base64 bytes]", chunk.content.len());
                }
            }
        }
        anyhow::Ok(failed)
    };
    let outcome = run.await;

    if let Err(e) = codebox.stop().await {
        tracing::warn!(error = %e, "Failed to stop session");
    }

    if outcome? {
        std::process::exit(1);
    }
    Ok(())
}
