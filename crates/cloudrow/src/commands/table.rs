use crate::TableCommands;
use crate::project::Project;
use cloudrow_cloud_sim::SimError;
use colored::Colorize;

pub async fn handle(project: &Project, command: TableCommands) -> anyhow::Result<()> {
    match command {
        TableCommands::List { table, json } => list(project, table.as_deref(), json).await,
        TableCommands::Insert { table, row } => {
            check_table(project, &table).await?;
            let row = parse_object(&row)?;
            let id = project
                .store
                .transact(|tables| Ok(tables.insert(&table, row)))
                .await?;
            println!("{} {} row {}", "Inserted".green(), table, id);
            Ok(())
        }
        TableCommands::Update { table, id, columns } => {
            let columns = parse_object(&columns)?;
            project
                .store
                .transact(|tables| tables.update(&table, id, columns))
                .await?;
            println!("{} {} row {}", "Updated".green(), table, id);
            Ok(())
        }
        TableCommands::Delete { table, id } => {
            if !project.store.remove(&table, id).await? {
                anyhow::bail!("{} row {} does not exist", table, id);
            }
            println!("{} {} row {}", "Deleted".green(), table, id);
            Ok(())
        }
    }
}

async fn list(project: &Project, table: Option<&str>, json: bool) -> anyhow::Result<()> {
    let snapshot = project.store.snapshot().await;
    let tables: Vec<&String> = snapshot
        .tables
        .keys()
        .filter(|name| table.is_none_or(|t| t == name.as_str()))
        .collect();

    if json {
        let selected: serde_json::Map<String, serde_json::Value> = tables
            .iter()
            .map(|name| {
                let rows = snapshot
                    .rows(name)
                    .map(|(id, row)| (id.to_string(), serde_json::Value::Object(row.clone())))
                    .collect();
                (name.to_string(), serde_json::Value::Object(rows))
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&selected)?);
        return Ok(());
    }

    if tables.is_empty() {
        println!("{}", "No rows".dimmed());
        return Ok(());
    }
    for name in tables {
        println!("{} ({} rows)", name.cyan().bold(), snapshot.len(name));
        for (id, row) in snapshot.rows(name) {
            println!("  {:>4}  {}", id, serde_json::Value::Object(row.clone()));
        }
    }
    Ok(())
}

async fn check_table(project: &Project, table: &str) -> anyhow::Result<()> {
    let registry = project.registry()?;
    let Some(module) = registry
        .modules()
        .iter()
        .find(|m| m.kinds().any(|kind| kind == table))
    else {
        let known: Vec<&str> = registry.mappers().iter().map(|m| m.kind()).collect();
        anyhow::bail!("unknown table '{}'. Tables: {}", table, known.join(", "))
    };
    if !project.installed(&registry).await.contains(module.name) {
        anyhow::bail!(
            "table '{}' belongs to module {}, which is not installed",
            table,
            module.name
        );
    }
    Ok(())
}

fn parse_object(json: &str) -> Result<serde_json::Map<String, serde_json::Value>, SimError> {
    match serde_json::from_str(json)? {
        serde_json::Value::Object(row) => Ok(row),
        other => Err(SimError::InvalidParameter(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}
