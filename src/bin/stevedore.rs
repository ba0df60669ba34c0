use anyhow::{anyhow, bail};
use std::env;
use stevedore::profile::Context;
use stevedore::{run_task, tasks};

fn main() -> anyhow::Result<()> {
    let mut args = env::args().skip(1);
    let profile = args.next().ok_or(anyhow!(
        "usage: stevedore <profile> <task>...\navailable tasks: {}",
        tasks::TASK_NAMES.join(", "),
    ))?;
    let names: Vec<String> = args.collect();
    if names.is_empty() {
        bail!(
            "no tasks requested; available tasks: {}",
            tasks::TASK_NAMES.join(", "),
        );
    }

    // The context resolves exactly once; every task in this invocation shares it.
    let context = Context::resolve(&profile)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    // Drive the deployment from a worker thread so the reporter may block in place.
    let driver = runtime.spawn(drive(context, names));
    runtime.block_on(driver)?
}

async fn drive(context: Context, names: Vec<String>) -> anyhow::Result<()> {
    for name in &names {
        let task = tasks::task(name, &context)?;
        if let Err(errors) = run_task(&task, &context).await {
            for (host, error) in &errors {
                eprintln!("[{host}] {error:#}");
            }
            bail!(
                "task {name} failed on {} of {} host(s)",
                errors.len(),
                context.hosts.len(),
            );
        }
    }
    Ok(())
}
