//! End-to-end runs of the sample modules against the simulated provider

use cloudrow_cloud_sim::{
    DEFAULT_RULE, FirewallRule, Instance, InstanceState, LoadBalancer, Network, Registration,
    SimCloud, SimError, SimSession, Subnet, TableStore, registry,
};
use cloudrow_engine::{
    ActionType, Backoff, ChangeCounts, Context, Credentials, Engine, EngineConfig, IdentityCodec,
    Mode, Relation, RetryPolicy, RowId, RunReport, RunRequest, Scope, WaitConfig,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const US: &str = "us-east-1";
const EU: &str = "eu-west-1";

struct Harness {
    sim: SimCloud,
    store: Arc<TableStore>,
    engine: Engine,
    disabled: Vec<String>,
}

fn wait() -> WaitConfig {
    WaitConfig {
        backoff: Backoff::fixed(Duration::from_millis(1)),
        timeout: Duration::from_secs(5),
    }
}

fn config() -> EngineConfig {
    EngineConfig {
        retry: RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Backoff::fixed(Duration::from_millis(1))),
        ..EngineConfig::default()
    }
}

impl Harness {
    fn new(regions: &[&str]) -> Self {
        Self::with(SimCloud::with_regions(regions.iter().copied()), TableStore::in_memory())
    }

    fn with(sim: SimCloud, store: TableStore) -> Self {
        Self::with_wait(sim, store, wait())
    }

    fn with_wait(sim: SimCloud, store: TableStore, wait: WaitConfig) -> Self {
        let store = Arc::new(store);
        let engine = Engine::new(registry(&sim, &store, wait).unwrap(), config());
        Self {
            sim,
            store,
            engine,
            disabled: Vec::new(),
        }
    }

    fn disable(mut self, region: &str) -> Self {
        self.disabled.push(region.to_string());
        self
    }

    fn ctx(&self) -> Context {
        let scopes = self.sim.regions().into_iter().map(|region| {
            if self.disabled.contains(&region) {
                Scope::disabled(region)
            } else {
                Scope::enabled(region)
            }
        });
        Context::builder("acme")
            .scopes(scopes)
            .default_credentials(Credentials::new("AKIA", "secret"))
            .build()
    }

    async fn run(&self, request: RunRequest) -> RunReport {
        self.engine.run(self.ctx(), &request).await.unwrap()
    }

    async fn reconcile(&self) -> RunReport {
        self.run(RunRequest::new("acme")).await
    }

    /// Provider session for out-of-band changes
    async fn session(&self, region: &str) -> Arc<SimSession> {
        self.ctx().session(&self.sim, region).await.unwrap()
    }

    async fn declare<E: Serialize + Sync>(&self, table: &str, entity: &E) -> RowId {
        self.store.insert(table, entity).await.unwrap()
    }

    async fn rows<E: DeserializeOwned>(&self, table: &str) -> Vec<(RowId, E)> {
        self.store.rows(table).await.unwrap()
    }

    async fn row<E: DeserializeOwned>(&self, table: &str, row: RowId) -> E {
        self.rows::<E>(table)
            .await
            .into_iter()
            .find(|(id, _)| *id == row)
            .map(|(_, e)| e)
            .unwrap()
    }

    /// Overwrite some columns of a declared row
    async fn patch(&self, table: &str, row: RowId, columns: serde_json::Value) {
        let columns = columns.as_object().cloned().unwrap();
        self.store
            .transact(|tables| tables.update(table, row, columns))
            .await
            .unwrap();
    }
}

fn network_ref(row: RowId) -> Relation {
    Relation::new("network", IdentityCodec::pending_id(row))
}

fn counts(created: usize, imported: usize) -> ChangeCounts {
    ChangeCounts {
        created,
        imported,
        ..ChangeCounts::default()
    }
}

#[tokio::test]
async fn test_declared_network_is_created_and_written_back() {
    let h = Harness::new(&[US]);
    let row = h.declare("network", &Network::new(US, "main", "10.0.0.0/16")).await;

    let report = h.run(RunRequest::new("acme").module("networking")).await;
    assert!(report.is_success());

    let module = report.module("networking").unwrap();
    assert!(module.converged);
    // One pass per dependency level, then one that finds nothing left
    assert!((2..=3).contains(&module.passes), "{} passes", module.passes);
    assert_eq!(report.counts_for("network"), counts(1, 0));
    // The network brings its default rule along
    assert_eq!(report.counts_for("firewall_rule"), counts(0, 1));

    let network: Network = h.row("network", row).await;
    let network_id = network.network_id.unwrap();
    assert!(h.sim.inspect(|w| w.regions[US].networks.contains_key(&network_id)));

    let again = h.reconcile().await;
    assert!(again.counts().is_empty());
    assert_eq!(again.module("networking").unwrap().passes, 1);
}

#[tokio::test]
async fn test_out_of_band_rule_is_imported() {
    let h = Harness::new(&[US]);
    let session = h.session(US).await;
    let network = session.create_network("main", "10.0.0.0/16").unwrap();
    session.create_rule(&network.network_id, "ssh", "tcp", 22).unwrap();

    let report = h.run(RunRequest::new("acme").module("networking")).await;
    assert!(report.is_success());
    assert_eq!(report.counts_for("network"), counts(0, 1));
    assert_eq!(report.counts_for("firewall_rule"), counts(0, 2));

    let rules = h.rows::<FirewallRule>("firewall_rule").await;
    let ssh = rules.iter().find(|(_, r)| r.name == "ssh").map(|(_, r)| r).unwrap();
    assert_eq!(ssh.port, 22);
    assert!(ssh.network.points_to("network", &format!("{}|{}", US, network.network_id)));
}

#[tokio::test]
async fn test_instance_replace_migrates_registration() {
    let h = Harness::new(&[US]);
    let net = h.declare("network", &Network::new(US, "main", "10.0.0.0/16")).await;
    h.declare("subnet", &Subnet::new(US, "web", network_ref(net), "10.0.1.0/24"))
        .await;
    h.declare("load_balancer", &LoadBalancer::new(US, "front", "internet-facing"))
        .await;
    let subnet = Relation::new("subnet", format!("{}|web", US));
    let vm = h
        .declare("instance", &Instance::new(US, "web-1", "img-a", subnet).with_description("web"))
        .await;
    let reg = h
        .declare(
            "registration",
            &Registration::new(
                US,
                Relation::new("load_balancer", format!("{}|front", US)),
                Relation::new("instance", IdentityCodec::pending_id(vm)),
            ),
        )
        .await;

    let first = h.reconcile().await;
    assert!(first.is_success());
    for module in &first.modules {
        assert!((2..=3).contains(&module.passes), "{}: {} passes", module.name, module.passes);
    }
    assert_eq!(first.counts_for("subnet"), counts(1, 0));
    assert_eq!(first.counts_for("instance"), counts(1, 0));
    assert_eq!(first.counts_for("registration"), counts(1, 0));

    let launched: Instance = h.row("instance", vm).await;
    let old_id = launched.instance_id.clone().unwrap();
    assert_eq!(launched.state, Some(InstanceState::Running));
    let registration: Registration = h.row("registration", reg).await;
    assert_eq!(registration.instance.id, format!("{}|{}", US, old_id));

    h.patch(
        "instance",
        vm,
        serde_json::json!({ "image": "img-b", "description": "frontend" }),
    )
    .await;
    let second = h.run(RunRequest::new("acme").module("compute")).await;
    assert!(second.is_success());
    assert_eq!(second.counts_for("instance").replaced, 1);
    assert_eq!(second.counts_for("registration").created, 1);

    let replaced: Instance = h.row("instance", vm).await;
    let new_id = replaced.instance_id.clone().unwrap();
    assert_ne!(new_id, old_id);
    assert_eq!(replaced.image, "img-b");
    assert_eq!(replaced.description, "frontend");

    let registration: Registration = h.row("registration", reg).await;
    assert_eq!(registration.instance.id, format!("{}|{}", US, new_id));

    let (old_state, registrations) = h.sim.inspect(|w| {
        let region = &w.regions[US];
        (
            region.instances[&old_id].state,
            region.registrations.iter().cloned().collect::<Vec<_>>(),
        )
    });
    assert_eq!(old_state, InstanceState::Terminated);
    assert_eq!(registrations, vec![("front".to_string(), new_id)]);

    assert!(h.reconcile().await.counts().is_empty());
}

#[tokio::test]
async fn test_undeclared_registration_is_pruned() {
    let h = Harness::new(&[US]);
    let session = h.session(US).await;
    let network = session.create_network("main", "10.0.0.0/16").unwrap();
    let subnet = session.create_subnet("web", &network.network_id, "10.0.1.0/24").unwrap();
    session.create_load_balancer("front", "internal").unwrap();
    h.sim.set_settle_polls(0);
    let vm = session.run_instance("web-1", "img-a", "", &subnet.subnet_id).unwrap();
    session.register_instance("front", &vm.instance_id).unwrap();

    let report = h.run(RunRequest::new("acme").module("compute")).await;
    assert!(report.is_success());
    assert_eq!(report.counts_for("load_balancer"), counts(0, 1));
    assert_eq!(report.counts_for("instance"), counts(0, 1));
    assert_eq!(report.counts_for("registration").pruned, 1);
    assert!(h.sim.inspect(|w| w.regions[US].registrations.is_empty()));
}

#[tokio::test]
async fn test_apply_tears_down_undeclared_networking() {
    let h = Harness::new(&[US]);
    let session = h.session(US).await;
    let network = session.create_network("main", "10.0.0.0/16").unwrap();
    session.create_subnet("web", &network.network_id, "10.0.1.0/24").unwrap();
    session.create_rule(&network.network_id, "ssh", "tcp", 22).unwrap();

    let report = h
        .run(RunRequest::new("acme").module("networking").mode(Mode::Apply))
        .await;
    assert!(report.is_success());

    // Rules and subnets go before the network that holds them
    let module = report.module("networking").unwrap();
    assert!(module.converged);
    assert!((2..=3).contains(&module.passes), "{} passes", module.passes);
    assert_eq!(report.counts_for("network").deleted, 1);
    assert_eq!(report.counts_for("subnet").deleted, 1);
    assert_eq!(report.counts_for("firewall_rule").deleted, 2);

    let empty = h.sim.inspect(|w| {
        let r = &w.regions[US];
        r.networks.is_empty() && r.subnets.is_empty() && r.rules.is_empty()
    });
    assert!(empty);
}

#[tokio::test]
async fn test_apply_tears_down_instances_before_their_network() {
    let h = Harness::new(&[US]);
    let session = h.session(US).await;
    let network = session.create_network("main", "10.0.0.0/16").unwrap();
    let subnet = session.create_subnet("web", &network.network_id, "10.0.1.0/24").unwrap();
    let vm = session.run_instance("web-1", "img-a", "", &subnet.subnet_id).unwrap();

    let report = h.run(RunRequest::new("acme").mode(Mode::Apply)).await;
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.counts_for("instance").deleted, 1);
    assert_eq!(report.counts_for("subnet").deleted, 1);
    assert_eq!(report.counts_for("network").deleted, 1);
    for module in &report.modules {
        assert!(module.converged, "{:?}", module);
        assert!(module.mappers.iter().all(|m| m.skipped.is_none()), "{:?}", module);
        assert!(module.passes <= 3, "{}: {} passes", module.name, module.passes);
    }

    let (state, empty) = h.sim.inspect(|w| {
        let r = &w.regions[US];
        (
            r.instances[&vm.instance_id].state,
            r.networks.is_empty() && r.subnets.is_empty(),
        )
    });
    assert_eq!(state, InstanceState::Terminated);
    assert!(empty);
}

#[tokio::test]
async fn test_slow_launch_is_recorded_once() {
    let h = Harness::with_wait(
        SimCloud::with_regions([US]),
        TableStore::in_memory(),
        WaitConfig {
            backoff: Backoff::fixed(Duration::from_millis(1)),
            timeout: Duration::from_millis(20),
        },
    );
    let session = h.session(US).await;
    let network = session.create_network("main", "10.0.0.0/16").unwrap();
    session.create_subnet("web", &network.network_id, "10.0.1.0/24").unwrap();
    // Instances never leave the pending state
    h.sim.set_settle_polls(1_000_000);
    let subnet = Relation::new("subnet", format!("{}|web", US));
    let vm = h.declare("instance", &Instance::new(US, "web-1", "img-a", subnet)).await;

    let report = h.reconcile().await;
    assert!(report.is_success(), "{:?}", report);
    assert_eq!(report.counts_for("instance"), counts(1, 0));

    let rows = h.rows::<Instance>("instance").await;
    assert_eq!(rows.len(), 1);
    let launched: Instance = h.row("instance", vm).await;
    let instance_id = launched.instance_id.unwrap();
    assert_eq!(launched.state, Some(InstanceState::Pending));
    assert_eq!(h.sim.inspect(|w| w.regions[US].instances.len()), 1);
    assert!(h.sim.inspect(|w| w.regions[US].instances.contains_key(&instance_id)));

    let again = h.reconcile().await;
    assert!(again.is_success());
    assert!(again.counts().is_empty());
    assert_eq!(h.sim.inspect(|w| w.regions[US].instances.len()), 1);
}

#[tokio::test]
async fn test_default_network_is_restored_in_apply_mode() {
    let h = Harness::new(&[US]);
    let default = h.sim.add_default_network(US, "172.31.0.0/16").unwrap();

    let report = h
        .run(RunRequest::new("acme").module("networking").mode(Mode::Apply))
        .await;
    assert!(report.is_success());
    assert_eq!(report.counts_for("network").restored, 1);
    assert_eq!(report.counts_for("firewall_rule").restored, 1);
    assert_eq!(report.counts_for("network").deleted, 0);

    let networks = h.rows::<Network>("network").await;
    assert_eq!(networks.len(), 1);
    assert!(networks[0].1.is_default);
    assert_eq!(networks[0].1.network_id.as_deref(), Some(default.network_id.as_str()));
    assert!(h.sim.inspect(|w| w.regions[US].networks.contains_key(&default.network_id)));

    let again = h
        .run(RunRequest::new("acme").module("networking").mode(Mode::Apply))
        .await;
    assert!(again.counts().is_empty());
}

#[tokio::test]
async fn test_default_rule_edits_are_reverted() {
    let h = Harness::new(&[US]);
    h.declare("network", &Network::new(US, "main", "10.0.0.0/16")).await;
    h.reconcile().await;

    let rules = h.rows::<FirewallRule>("firewall_rule").await;
    let (row, _) = rules.iter().find(|(_, r)| r.name == DEFAULT_RULE).unwrap();
    h.patch("firewall_rule", *row, serde_json::json!({ "port": 22 })).await;

    let report = h.reconcile().await;
    assert!(report.is_success());
    assert_eq!(report.counts_for("firewall_rule").restored, 1);
    let restored: FirewallRule = h.row("firewall_rule", *row).await;
    assert_eq!(restored.port, 0);
}

#[tokio::test]
async fn test_declared_default_rule_is_rejected() {
    let h = Harness::new(&[US]);
    let net = h.declare("network", &Network::new(US, "main", "10.0.0.0/16")).await;
    h.declare(
        "firewall_rule",
        &FirewallRule::new(US, network_ref(net), DEFAULT_RULE, "all", 0),
    )
    .await;

    let report = h.run(RunRequest::new("acme").module("networking")).await;
    assert!(!report.is_success());
    let failure = report
        .module("networking")
        .unwrap()
        .mapper("firewall_rule")
        .unwrap()
        .failure
        .clone()
        .unwrap();
    assert!(failure.message.contains("cannot be declared"));
}

#[tokio::test]
async fn test_sync_refreshes_declared_state() {
    let h = Harness::new(&[US]);
    let row = h.declare("network", &Network::new(US, "main", "10.0.0.0/16")).await;
    h.reconcile().await;

    let network: Network = h.row("network", row).await;
    let network_id = network.network_id.unwrap();
    h.session(US)
        .await
        .modify_network(&network_id, "main", "10.1.0.0/16")
        .unwrap();

    let report = h
        .run(RunRequest::new("acme").module("networking").mode(Mode::Sync))
        .await;
    assert_eq!(report.counts_for("network").updated, 1);
    let refreshed: Network = h.row("network", row).await;
    assert_eq!(refreshed.cidr, "10.1.0.0/16");
}

#[tokio::test]
async fn test_reconcile_overwrites_drift() {
    let h = Harness::new(&[US]);
    let row = h.declare("network", &Network::new(US, "main", "10.0.0.0/16")).await;
    h.reconcile().await;

    let network_id = h.row::<Network>("network", row).await.network_id.unwrap();
    h.session(US)
        .await
        .modify_network(&network_id, "main", "10.1.0.0/16")
        .unwrap();

    let report = h.reconcile().await;
    assert_eq!(report.counts_for("network").updated, 1);
    let cidr = h.sim.inspect(|w| w.regions[US].networks[&network_id].cidr.clone());
    assert_eq!(cidr, "10.0.0.0/16");
}

#[tokio::test]
async fn test_throttled_reads_are_retried() {
    let h = Harness::new(&[US]);
    h.declare("network", &Network::new(US, "main", "10.0.0.0/16")).await;
    h.sim
        .fail_next("describe_networks", SimError::Throttled("rate exceeded".into()));
    h.sim
        .fail_next("describe_networks", SimError::Throttled("rate exceeded".into()));

    let report = h.reconcile().await;
    assert!(report.is_success());
    assert_eq!(report.counts_for("network").created, 1);
}

#[tokio::test]
async fn test_missing_relation_fails_mapper_and_skips_dependents() {
    let h = Harness::new(&[US]);
    let dangling = Relation::new("network", format!("{}|net-404", US));
    h.declare("subnet", &Subnet::new(US, "web", dangling, "10.0.1.0/24"))
        .await;
    h.declare(
        "instance",
        &Instance::new(US, "web-1", "img-a", Relation::new("subnet", format!("{}|web", US))),
    )
    .await;

    let report = h.reconcile().await;
    assert!(!report.is_success());

    let subnet = report.module("networking").unwrap().mapper("subnet").unwrap();
    let failure = subnet.failure.as_ref().unwrap();
    assert!(failure.message.contains("Missing relation"));

    let instance = report.module("compute").unwrap().mapper("instance").unwrap();
    assert!(instance.skipped.is_some());
    assert!(h.sim.inspect(|w| w.regions[US].instances.is_empty()));
}

#[tokio::test]
async fn test_regions_fan_out_and_disabled_regions_are_ignored() {
    let h = Harness::new(&[US, EU]);
    h.session(EU).await.create_network("legacy", "10.9.0.0/16").unwrap();
    let h = h.disable(EU);
    h.declare("network", &Network::new(US, "main", "10.0.0.0/16")).await;
    h.declare("network", &Network::new(EU, "main", "10.8.0.0/16")).await;

    let report = h.reconcile().await;
    assert!(report.is_success());
    assert_eq!(report.counts_for("network"), counts(1, 0));

    let networks = h.rows::<Network>("network").await;
    let eu_row = networks.iter().find(|(_, n)| n.region == EU).unwrap();
    assert!(eu_row.1.network_id.is_none());
    assert_eq!(h.sim.inspect(|w| w.regions[EU].networks.len()), 1);
}

#[tokio::test]
async fn test_imports_from_every_enabled_region() {
    let h = Harness::new(&[US, EU]);
    h.session(US).await.create_network("a", "10.0.0.0/16").unwrap();
    h.session(EU).await.create_network("b", "10.8.0.0/16").unwrap();

    let report = h.run(RunRequest::new("acme").mapper("network")).await;
    assert_eq!(report.counts_for("network"), counts(0, 2));

    let mut regions: Vec<String> = h
        .rows::<Network>("network")
        .await
        .into_iter()
        .map(|(_, n)| n.region)
        .collect();
    regions.sort();
    assert_eq!(regions, vec![EU.to_string(), US.to_string()]);
}

#[tokio::test]
async fn test_dry_run_plans_without_touching_the_provider() {
    let h = Harness::new(&[US]);
    h.declare("network", &Network::new(US, "main", "10.0.0.0/16")).await;
    h.declare("load_balancer", &LoadBalancer::new(US, "front", "internal"))
        .await;

    let report = h.run(RunRequest::new("acme").dry_run(true)).await;
    let plan = report.plan.unwrap();
    assert!(plan.has_changes);
    assert_eq!(plan.actions_by_type(ActionType::Create).len(), 2);
    assert_eq!(plan.actions_for_kind("network").count(), 1);

    let untouched = h.sim.inspect(|w| {
        w.regions[US].networks.is_empty() && w.regions[US].load_balancers.is_empty()
    });
    assert!(untouched);
    assert!(h.rows::<Network>("network").await[0].1.network_id.is_none());
}

#[tokio::test]
async fn test_state_survives_restart() {
    let temp_dir = tempdir().unwrap();
    let cloud_file = temp_dir.path().join("cloud.json");

    {
        let sim = SimCloud::with_regions([US]);
        let h = Harness::with(sim, TableStore::open(temp_dir.path()).await.unwrap());
        h.declare("network", &Network::new(US, "main", "10.0.0.0/16")).await;
        assert_eq!(h.reconcile().await.counts_for("network").created, 1);
        h.sim.save(&cloud_file).await.unwrap();
    }

    let sim = SimCloud::load(&cloud_file).await.unwrap();
    let h = Harness::with(sim, TableStore::open(temp_dir.path()).await.unwrap());
    let report = h.reconcile().await;
    assert!(report.counts().is_empty());
}
