use clap::Parser;
use training::logging::init_tracing;
use training::util::{resolve_config, run, SegmentationArgs};

fn main() -> anyhow::Result<()> {
    let args = SegmentationArgs::parse();
    let cfg = resolve_config(&args)?;
    init_tracing(cfg.log_path.as_deref())?;
    let summary = run(&args, &cfg)?;
    tracing::info!(loss = summary.loss, dice = summary.dice, "done");
    Ok(())
}
