//! The working directory's provider, store and settings, opened together

use anyhow::Context as _;
use cloudrow_cloud_sim::{SimCloud, TableStore};
use cloudrow_config::Settings;
use cloudrow_engine::{Context, Credentials, Engine, Registry, Scope};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const PROJECT_DIR: &str = ".cloudrow";
const CLOUD_FILE: &str = "cloud.json";
const DEFAULT_ACCOUNT: &str = "default";
const DEFAULT_REGION: &str = "us-east-1";
const DEFAULT_NETWORK_CIDR: &str = "172.31.0.0/16";

pub struct Project {
    pub root: PathBuf,
    pub settings: Settings,
    pub settings_path: Option<PathBuf>,
    pub sim: SimCloud,
    pub store: Arc<TableStore>,
}

impl Project {
    /// Open the project in the current directory, provisioning a fresh
    /// simulated account on first use.
    pub async fn open() -> anyhow::Result<Self> {
        let root = std::env::current_dir()?;
        let (settings, settings_path) = cloudrow_config::load_settings()?;
        if let Some(path) = &settings_path {
            tracing::debug!("Loaded settings from {}", path.display());
        }

        let cloud_file = cloud_file(&root);
        let sim = SimCloud::load(&cloud_file)
            .await
            .with_context(|| format!("failed to load {}", cloud_file.display()))?;
        if sim.regions().is_empty() {
            provision(&sim, &settings)?;
        }

        let store = TableStore::open(&root).await?;

        Ok(Self {
            root,
            settings,
            settings_path,
            sim,
            store: Arc::new(store),
        })
    }

    pub fn registry(&self) -> anyhow::Result<Registry> {
        let registry =
            cloudrow_cloud_sim::registry(&self.sim, &self.store, self.settings.wait_config())?;
        Ok(registry)
    }

    pub fn engine(&self) -> anyhow::Result<Engine> {
        Ok(Engine::new(self.registry()?, self.settings.engine_config()))
    }

    /// Modules installed in this project. Every registered module counts as
    /// installed until the project records its own set.
    pub async fn installed(&self, registry: &Registry) -> BTreeSet<String> {
        match self.store.snapshot().await.modules {
            Some(modules) => modules,
            None => registry
                .modules()
                .iter()
                .map(|m| m.name.to_string())
                .collect(),
        }
    }

    /// Account named on the command line, in the settings, or the default
    pub fn account(&self, requested: Option<String>) -> String {
        requested
            .or_else(|| self.settings.account.clone())
            .unwrap_or_else(|| DEFAULT_ACCOUNT.to_string())
    }

    /// Run context over the provider's regions, minus those the settings disable
    pub fn context(&self, account: &str) -> Context {
        let scopes = self.sim.regions().into_iter().map(|region| {
            if self.settings.scope_enabled(&region) {
                Scope::enabled(region)
            } else {
                Scope::disabled(region)
            }
        });

        Context::builder(account)
            .scopes(scopes)
            .default_credentials(credentials())
            .build()
    }

    pub async fn save_cloud(&self) -> anyhow::Result<()> {
        self.sim.save(cloud_file(&self.root)).await?;
        Ok(())
    }
}

fn cloud_file(root: &Path) -> PathBuf {
    root.join(PROJECT_DIR).join(CLOUD_FILE)
}

/// Regions from the settings, or a single default region, each with its
/// default network.
fn provision(sim: &SimCloud, settings: &Settings) -> anyhow::Result<()> {
    let mut regions: Vec<String> = settings.scopes.keys().cloned().collect();
    if regions.is_empty() {
        regions.push(DEFAULT_REGION.to_string());
    }

    for region in &regions {
        sim.add_region(region.clone());
        sim.add_default_network(region, DEFAULT_NETWORK_CIDR)?;
    }
    tracing::info!("Provisioned simulated regions: {}", regions.join(", "));
    Ok(())
}

fn credentials() -> Credentials {
    match Credentials::from_env() {
        Ok(credentials) => credentials,
        Err(e) => {
            tracing::warn!("{}; using the simulator's built-in credentials", e);
            Credentials::new("SIMULATED", "simulated")
        }
    }
}
