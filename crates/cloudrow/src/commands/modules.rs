use crate::project::Project;
use cloudrow_engine::{Engine, Mode, RegisteredModule, RunRequest};
use colored::Colorize;
use std::collections::BTreeSet;

pub async fn handle(project: &Project) -> anyhow::Result<()> {
    let registry = project.registry()?;
    let installed = project.installed(&registry).await;

    for module in registry.modules() {
        let deps = if module.dependencies.is_empty() {
            String::new()
        } else {
            format!(" (after {})", module.dependencies.join(", "))
        };
        let name = if installed.contains(module.name) {
            module.name.cyan().bold()
        } else {
            module.name.dimmed()
        };
        let state = if installed.contains(module.name) {
            String::new()
        } else {
            " not installed".yellow().to_string()
        };
        println!("{} v{}{}{}", name, module.version, deps.dimmed(), state);
        for mapper in &module.mappers {
            let depends_on = mapper.depends_on();
            if depends_on.is_empty() {
                println!("  - {}", mapper.kind());
            } else {
                println!("  - {} -> {}", mapper.kind(), depends_on.join(", "));
            }
        }
    }
    Ok(())
}

/// Install modules and whatever they depend on, then fill their tables from
/// the provider. Returns whether every import run succeeded.
pub async fn install(
    project: &Project,
    account: Option<String>,
    names: Vec<String>,
) -> anyhow::Result<bool> {
    let engine = project.engine()?;
    let installed = project.installed(engine.registry()).await;
    let requested: Vec<&str> = names.iter().map(String::as_str).collect();
    let order = engine.registry().install_order(&installed, &requested)?;
    if order.is_empty() {
        println!("{}", "Already installed".green());
        return Ok(true);
    }

    let account = project.account(account);
    let lock = project.store.acquire_lock().await?;
    let result = install_locked(project, &engine, &account, &installed, &order).await;
    lock.release().await?;
    result
}

async fn install_locked(
    project: &Project,
    engine: &Engine,
    account: &str,
    installed: &BTreeSet<String>,
    order: &[&RegisteredModule],
) -> anyhow::Result<bool> {
    // Leftover rows would be taken for declared state on the next reconcile
    let tables = project.store.snapshot().await;
    for module in order {
        let occupied: Vec<&str> = module.kinds().filter(|kind| tables.len(kind) > 0).collect();
        if !occupied.is_empty() {
            anyhow::bail!(
                "cannot install {}: table(s) {} already hold rows",
                module.name,
                occupied.join(", ")
            );
        }
    }

    project
        .store
        .transact(|tables| {
            for module in order {
                tables.install(installed, module.name);
            }
            Ok(())
        })
        .await?;
    let now_installed = project.installed(engine.registry()).await;

    let mut ok = true;
    for module in order {
        let request = RunRequest::new(account)
            .mode(Mode::Sync)
            .module(module.name)
            .installed(now_installed.iter().cloned());
        let report = engine.run(project.context(account), &request).await?;
        let counts = report.counts();
        if report.is_success() {
            println!("{} {} ({} imported)", "Installed".green(), module.name.bold(), counts.imported);
        } else {
            println!(
                "{} {} but its import failed; reconcile to retry",
                "Installed".yellow(),
                module.name.bold()
            );
            ok = false;
        }
    }
    // Imported rows point at the provider as this process sees it
    project.save_cloud().await?;
    Ok(ok)
}

/// Uninstall modules, dropping their tables. Provider resources are kept.
pub async fn uninstall(project: &Project, names: Vec<String>) -> anyhow::Result<()> {
    let registry = project.registry()?;
    let installed = project.installed(&registry).await;
    let requested: Vec<&str> = names.iter().map(String::as_str).collect();
    let order = registry.uninstall_order(&installed, &requested)?;
    if order.is_empty() {
        println!("{}", "Not installed".green());
        return Ok(());
    }

    let lock = project.store.acquire_lock().await?;
    let result = project
        .store
        .transact(|tables| {
            for module in &order {
                tables.uninstall(&installed, module.name, module.kinds());
            }
            Ok(())
        })
        .await;
    lock.release().await?;
    result?;

    for module in &order {
        println!(
            "{} {} (tables dropped, provider resources kept)",
            "Uninstalled".yellow(),
            module.name.bold()
        );
    }
    Ok(())
}
