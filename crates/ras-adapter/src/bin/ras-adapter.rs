use clap::Parser;

use ras_adapter::bootstrap::{check_snapshot, run_adapter};
use ras_adapter::common::cli::{CheckOpts, CommonOpts, RootOptions, RunOpts, SubCommand};
use ras_adapter::common::setup::setup_logging;
use ras_adapter::config::{CliOverrides, load_settings};

async fn command_run(common: &CommonOpts, opts: RunOpts) -> anyhow::Result<()> {
    let settings = load_settings(
        common.config.as_deref(),
        CliOverrides {
            mode: opts.mode,
            snapshot: opts.source.snapshot,
            action_journal: opts.action_journal,
        },
    )?;
    run_adapter(settings).await
}

fn command_check(common: &CommonOpts, opts: CheckOpts) -> anyhow::Result<()> {
    let settings = load_settings(
        common.config.as_deref(),
        CliOverrides {
            snapshot: opts.source.snapshot,
            ..Default::default()
        },
    )?;
    let summary = check_snapshot(&settings.snapshot)?;
    println!("Snapshot: {}", settings.snapshot.display());
    println!("{summary}");
    println!("Engine configuration: {:#?}", settings.engine);
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let top_opts = RootOptions::parse();

    setup_logging(top_opts.common.debug);

    let result = match top_opts.subcmd {
        SubCommand::Run(opts) => command_run(&top_opts.common, opts).await,
        SubCommand::Check(opts) => command_check(&top_opts.common, opts),
    };

    if let Err(e) = result {
        log::error!("{e:?}");
        std::process::exit(1);
    }
}
