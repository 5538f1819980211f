//! Human-readable run reports

use cloudrow_engine::{ActionType, ChangeCounts, Plan, RunReport};
use colored::Colorize;

pub fn print_report(report: &RunReport) {
    if let Some(plan) = &report.plan {
        print_plan(plan);
        return;
    }

    for module in &report.modules {
        let status = if module.is_success() {
            "✓".green()
        } else {
            "✗".red()
        };
        println!(
            "{} {} ({} pass{})",
            status,
            module.name.bold(),
            module.passes,
            if module.passes == 1 { "" } else { "es" }
        );
        for mapper in &module.mappers {
            if let Some(skipped) = &mapper.skipped {
                println!("    {} {}", mapper.kind, format!("skipped: {}", skipped).yellow());
            } else if !mapper.counts.is_empty() {
                println!("    {} {}", mapper.kind, describe(&mapper.counts));
            }
            if let Some(failure) = &mapper.failure {
                println!("    {}", failure.to_string().red());
            }
        }
        if let Some(error) = &module.error {
            println!("    {}", error.red());
        }
    }

    let total = report.counts();
    println!();
    if total.is_empty() {
        println!("{} ({} ms)", "No changes".green(), report.duration_ms);
    } else {
        println!("{} ({} ms)", total, report.duration_ms);
    }
}

fn describe(counts: &ChangeCounts) -> String {
    [
        ("created", counts.created),
        ("updated", counts.updated),
        ("replaced", counts.replaced),
        ("deleted", counts.deleted),
        ("imported", counts.imported),
        ("pruned", counts.pruned),
        ("restored", counts.restored),
    ]
    .iter()
    .filter(|(_, n)| *n > 0)
    .map(|(label, n)| format!("{} {}", n, label))
    .collect::<Vec<_>>()
    .join(", ")
}

fn print_plan(plan: &Plan) {
    if !plan.has_changes {
        println!("{}", "No changes. The provider matches the declared state.".green());
        return;
    }

    for action in &plan.actions {
        let symbol = match action.action_type {
            ActionType::Create | ActionType::Import => "+".green(),
            ActionType::Update | ActionType::Refresh | ActionType::Restore => "~".yellow(),
            ActionType::Replace => "±".yellow(),
            ActionType::Delete | ActionType::Prune | ActionType::Forget => "-".red(),
        };
        println!(
            "  {} {} {} {}",
            symbol,
            action.action_type,
            action.kind.cyan(),
            action.identity
        );
        if !action.description.is_empty() {
            println!("      {}", action.description.dimmed());
        }
    }
    println!();
    println!("Plan: {}", plan.summary());
}
