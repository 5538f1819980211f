use crate::Target;
use crate::output;
use crate::project::Project;
use cloudrow_engine::{Mode, RunReport, RunRequest};
use colored::Colorize;

/// Run the engine once. Returns whether every module settled cleanly.
pub async fn handle(
    project: &Project,
    mode: Mode,
    target: Target,
    dry_run: bool,
    json: bool,
) -> anyhow::Result<bool> {
    let account = project.account(target.account);
    let mut request = RunRequest::new(account.clone()).mode(mode).dry_run(dry_run);
    if let Some(module) = target.module {
        request = request.module(module);
    }
    if let Some(mapper) = target.mapper {
        request = request.mapper(mapper);
    }
    if let Some(id) = target.id {
        request = request.identity(id);
    }

    let engine = project.engine()?;
    request = request.installed(project.installed(engine.registry()).await);
    if !json {
        let verb = if dry_run { "Planning" } else { "Reconciling" };
        println!("{} {} ({} mode)", verb.blue(), account.cyan(), mode);
    }

    let lock = project.store.acquire_lock().await?;
    let result = engine.run(project.context(&account), &request).await;
    let result = save_after(project, result, dry_run).await;
    lock.release().await?;
    let report = result?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        output::print_report(&report);
    }
    Ok(report.is_success())
}

/// Save the provider after every run that could have changed it, including
/// runs that failed part way.
async fn save_after(
    project: &Project,
    result: cloudrow_engine::Result<RunReport>,
    dry_run: bool,
) -> anyhow::Result<RunReport> {
    if dry_run {
        return Ok(result?);
    }
    match (result, project.save_cloud().await) {
        (Ok(report), saved) => saved.map(|()| report),
        (Err(run), Ok(())) => Err(run.into()),
        (Err(run), Err(save)) => {
            tracing::error!("Provider state was not saved after the failed run: {}", save);
            Err(run.into())
        }
    }
}
