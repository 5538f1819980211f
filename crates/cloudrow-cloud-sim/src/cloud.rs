//! In-process cloud provider simulation
//!
//! Holds provider-native records per region and answers the calls a real
//! SDK would, including the awkward parts: implicit default resources,
//! dependency violations on delete, asynchronous instance lifecycles and
//! injectable faults. The world can be saved to and loaded from a JSON file
//! so the CLI can keep a "cloud" between invocations.

use crate::error::{Result, SimError};
use async_trait::async_trait;
use cloudrow_engine::{Credentials, Provider, Scope};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs;

const WORLD_VERSION: u32 = 1;
const DEFAULT_SETTLE_POLLS: u32 = 2;

/// Name of the firewall rule every network is created with
pub const DEFAULT_RULE: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub network_id: String,
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub subnet_id: String,
    pub name: String,
    pub network_id: String,
    pub cidr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub rule_id: String,
    pub network_id: String,
    pub name: String,
    pub protocol: String,
    pub port: u16,
}

impl RuleRecord {
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_RULE
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerRecord {
    pub arn: String,
    pub name: String,
    pub scheme: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "pending"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::ShuttingDown => write!(f, "shutting-down"),
            InstanceState::Terminated => write!(f, "terminated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub name: String,
    pub image: String,
    pub description: String,
    pub subnet_id: String,
    pub state: InstanceState,
    /// Describe calls left before the current transition completes
    #[serde(default)]
    pub polls: u32,
}

impl InstanceRecord {
    pub fn is_live(&self) -> bool {
        matches!(self.state, InstanceState::Pending | InstanceState::Running)
    }
}

/// Load balancer name and instance id
pub type RegistrationRecord = (String, String);

/// Everything the provider knows about one region
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Region {
    pub networks: BTreeMap<String, NetworkRecord>,
    pub subnets: BTreeMap<String, SubnetRecord>,
    pub rules: BTreeMap<String, RuleRecord>,
    pub load_balancers: BTreeMap<String, LoadBalancerRecord>,
    pub instances: BTreeMap<String, InstanceRecord>,
    pub registrations: BTreeSet<RegistrationRecord>,
}

impl Region {
    fn network(&self, network_id: &str) -> Result<&NetworkRecord> {
        self.networks
            .get(network_id)
            .ok_or_else(|| SimError::not_found("network", network_id))
    }

    fn live_instance(&self, instance_id: &str) -> Result<&InstanceRecord> {
        self.instances
            .get(instance_id)
            .filter(|i| i.is_live())
            .ok_or_else(|| SimError::not_found("instance", instance_id))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct World {
    pub version: u32,
    pub next_id: u64,
    pub settle_polls: u32,
    pub regions: BTreeMap<String, Region>,
    #[serde(skip)]
    faults: HashMap<String, VecDeque<SimError>>,
    #[serde(skip)]
    connects: u64,
}

impl Default for World {
    fn default() -> Self {
        Self {
            version: WORLD_VERSION,
            next_id: 0,
            settle_polls: DEFAULT_SETTLE_POLLS,
            regions: BTreeMap::new(),
            faults: HashMap::new(),
            connects: 0,
        }
    }
}

struct Ids<'a>(&'a mut u64);

impl Ids<'_> {
    fn next(&mut self, prefix: &str) -> String {
        *self.0 += 1;
        format!("{}-{:08x}", prefix, *self.0)
    }
}

/// Shared handle to a simulated provider
#[derive(Clone, Default)]
pub struct SimCloud {
    world: Arc<Mutex<World>>,
}

impl SimCloud {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_regions<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cloud = Self::new();
        for region in regions {
            cloud.add_region(region);
        }
        cloud
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_region(&self, region: impl Into<String>) {
        self.world().regions.entry(region.into()).or_default();
    }

    /// Regions the provider offers, discovered at run time
    pub fn regions(&self) -> Vec<String> {
        self.world().regions.keys().cloned().collect()
    }

    /// Describe calls an instance needs to settle after launch or termination
    pub fn set_settle_polls(&self, polls: u32) {
        self.world().settle_polls = polls;
    }

    /// Fail the next call of `operation` with `error`. Queued faults are
    /// consumed in order, one per call.
    pub fn fail_next(&self, operation: &str, error: SimError) {
        self.world()
            .faults
            .entry(operation.to_string())
            .or_default()
            .push_back(error);
    }

    /// Sessions opened against this provider so far
    pub fn connects(&self) -> u64 {
        self.world().connects
    }

    /// Look at the provider's records without going through a session
    pub fn inspect<T>(&self, f: impl FnOnce(&World) -> T) -> T {
        f(&self.world())
    }

    /// Create the region's default network with its default rule, the way
    /// a fresh account comes provisioned.
    pub fn add_default_network(&self, region: &str, cidr: &str) -> Result<NetworkRecord> {
        self.call(region, "create_network", |r, ids| {
            insert_network(r, ids, "default", cidr, true)
        })
    }

    /// Load a saved world, or start empty when the file does not exist.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("Cloud file not found, starting with an empty provider");
            return Ok(Self::new());
        }

        let content = fs::read_to_string(path).await?;
        let world: World = serde_json::from_str(&content)?;
        if world.version > WORLD_VERSION {
            return Err(SimError::Store(format!(
                "Cloud file version {} is newer than supported version {}",
                world.version, WORLD_VERSION
            )));
        }

        tracing::debug!("Loaded simulated cloud with {} regions", world.regions.len());
        Ok(Self {
            world: Arc::new(Mutex::new(world)),
        })
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(&*self.world())?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(path, content).await?;
        tracing::debug!("Saved simulated cloud to {}", path.display());
        Ok(())
    }

    fn call<T>(
        &self,
        region: &str,
        operation: &str,
        f: impl FnOnce(&mut Region, &mut Ids<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut world = self.world();
        let World {
            regions,
            next_id,
            faults,
            ..
        } = &mut *world;

        if let Some(err) = faults.get_mut(operation).and_then(VecDeque::pop_front) {
            tracing::debug!("Injected fault for {} in {}: {}", operation, region, err);
            return Err(err);
        }
        let region_state = regions
            .get_mut(region)
            .ok_or_else(|| SimError::RegionNotFound(region.to_string()))?;
        f(region_state, &mut Ids(next_id))
    }
}

impl std::fmt::Debug for SimCloud {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let world = self.world();
        f.debug_struct("SimCloud")
            .field("regions", &world.regions.keys().collect::<Vec<_>>())
            .field("connects", &world.connects)
            .finish()
    }
}

#[async_trait]
impl Provider for SimCloud {
    type Session = SimSession;

    async fn connect(
        &self,
        scope: &Scope,
        credentials: &Credentials,
    ) -> cloudrow_engine::Result<SimSession> {
        if credentials.access_key_id.is_empty() || credentials.secret_access_key().is_empty() {
            return Err(SimError::AuthenticationFailed(format!(
                "empty credentials for region {}",
                scope.name
            ))
            .into());
        }

        let mut world = self.world();
        if !world.regions.contains_key(&scope.name) {
            return Err(SimError::RegionNotFound(scope.name.clone()).into());
        }
        world.connects += 1;
        tracing::debug!("Connected to simulated region {}", scope.name);

        Ok(SimSession {
            cloud: self.clone(),
            region: scope.name.clone(),
        })
    }
}

fn insert_network(
    region: &mut Region,
    ids: &mut Ids<'_>,
    name: &str,
    cidr: &str,
    is_default: bool,
) -> Result<NetworkRecord> {
    validate_cidr(cidr)?;
    if is_default && region.networks.values().any(|n| n.is_default) {
        return Err(SimError::AlreadyExists {
            kind: "default network",
            name: name.to_string(),
        });
    }

    let network = NetworkRecord {
        network_id: ids.next("net"),
        name: name.to_string(),
        cidr: cidr.to_string(),
        is_default,
    };
    let rule = RuleRecord {
        rule_id: ids.next("rule"),
        network_id: network.network_id.clone(),
        name: DEFAULT_RULE.to_string(),
        protocol: "all".to_string(),
        port: 0,
    };
    region.rules.insert(rule.rule_id.clone(), rule);
    region
        .networks
        .insert(network.network_id.clone(), network.clone());
    Ok(network)
}

fn validate_cidr(cidr: &str) -> Result<()> {
    let valid = cidr.split_once('/').is_some_and(|(addr, bits)| {
        let octets: Vec<&str> = addr.split('.').collect();
        octets.len() == 4
            && octets.iter().all(|o| o.parse::<u8>().is_ok())
            && bits.parse::<u8>().is_ok_and(|b| b <= 32)
    });
    if valid {
        Ok(())
    } else {
        Err(SimError::InvalidParameter(format!("invalid CIDR block '{}'", cidr)))
    }
}

/// Region-qualified, authenticated session
pub struct SimSession {
    cloud: SimCloud,
    region: String,
}

impl SimSession {
    pub fn region(&self) -> &str {
        &self.region
    }

    fn call<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&mut Region, &mut Ids<'_>) -> Result<T>,
    ) -> Result<T> {
        self.cloud.call(&self.region, operation, f)
    }

    // Networks

    pub fn create_network(&self, name: &str, cidr: &str) -> Result<NetworkRecord> {
        self.call("create_network", |r, ids| {
            insert_network(r, ids, name, cidr, false)
        })
    }

    pub fn describe_networks(&self) -> Result<Vec<NetworkRecord>> {
        self.call("describe_networks", |r, _| Ok(r.networks.values().cloned().collect()))
    }

    pub fn modify_network(&self, network_id: &str, name: &str, cidr: &str) -> Result<NetworkRecord> {
        validate_cidr(cidr)?;
        self.call("modify_network", |r, _| {
            let network = r
                .networks
                .get_mut(network_id)
                .ok_or_else(|| SimError::not_found("network", network_id))?;
            network.name = name.to_string();
            network.cidr = cidr.to_string();
            Ok(network.clone())
        })
    }

    /// Delete a network along with its default rule. Refused while subnets
    /// or other rules still reference it.
    pub fn delete_network(&self, network_id: &str) -> Result<()> {
        self.call("delete_network", |r, _| {
            let network = r.network(network_id)?;
            if network.is_default {
                return Err(SimError::OperationNotPermitted(format!(
                    "network {} is the region's default network",
                    network_id
                )));
            }
            let subnets = r.subnets.values().filter(|s| s.network_id == network_id).count();
            let rules = r
                .rules
                .values()
                .filter(|rule| rule.network_id == network_id && !rule.is_default())
                .count();
            if subnets > 0 || rules > 0 {
                return Err(SimError::DependencyViolation(format!(
                    "network {} has {} subnet(s) and {} rule(s) attached",
                    network_id, subnets, rules
                )));
            }
            r.rules.retain(|_, rule| rule.network_id != network_id);
            r.networks.remove(network_id);
            Ok(())
        })
    }

    // Subnets

    pub fn create_subnet(&self, name: &str, network_id: &str, cidr: &str) -> Result<SubnetRecord> {
        validate_cidr(cidr)?;
        self.call("create_subnet", |r, ids| {
            if r.subnets.values().any(|s| s.name == name) {
                return Err(SimError::AlreadyExists {
                    kind: "subnet",
                    name: name.to_string(),
                });
            }
            r.network(network_id).map_err(|_| {
                SimError::InvalidParameter(format!("network {} does not exist", network_id))
            })?;
            let subnet = SubnetRecord {
                subnet_id: ids.next("subnet"),
                name: name.to_string(),
                network_id: network_id.to_string(),
                cidr: cidr.to_string(),
            };
            r.subnets.insert(subnet.subnet_id.clone(), subnet.clone());
            Ok(subnet)
        })
    }

    pub fn describe_subnets(&self) -> Result<Vec<SubnetRecord>> {
        self.call("describe_subnets", |r, _| Ok(r.subnets.values().cloned().collect()))
    }

    pub fn modify_subnet(&self, subnet_id: &str, network_id: &str, cidr: &str) -> Result<SubnetRecord> {
        validate_cidr(cidr)?;
        self.call("modify_subnet", |r, _| {
            r.network(network_id).map_err(|_| {
                SimError::InvalidParameter(format!("network {} does not exist", network_id))
            })?;
            let subnet = r
                .subnets
                .get_mut(subnet_id)
                .ok_or_else(|| SimError::not_found("subnet", subnet_id))?;
            subnet.network_id = network_id.to_string();
            subnet.cidr = cidr.to_string();
            Ok(subnet.clone())
        })
    }

    pub fn delete_subnet(&self, subnet_id: &str) -> Result<()> {
        self.call("delete_subnet", |r, _| {
            if !r.subnets.contains_key(subnet_id) {
                return Err(SimError::not_found("subnet", subnet_id));
            }
            let instances = r
                .instances
                .values()
                .filter(|i| i.subnet_id == subnet_id && i.state != InstanceState::Terminated)
                .count();
            if instances > 0 {
                return Err(SimError::DependencyViolation(format!(
                    "subnet {} still has {} instance(s)",
                    subnet_id, instances
                )));
            }
            r.subnets.remove(subnet_id);
            Ok(())
        })
    }

    // Firewall rules

    pub fn create_rule(&self, network_id: &str, name: &str, protocol: &str, port: u16) -> Result<RuleRecord> {
        if name == DEFAULT_RULE {
            return Err(SimError::InvalidParameter(format!(
                "rule name '{}' is reserved",
                DEFAULT_RULE
            )));
        }
        self.call("create_rule", |r, ids| {
            r.network(network_id).map_err(|_| {
                SimError::InvalidParameter(format!("network {} does not exist", network_id))
            })?;
            let rule = RuleRecord {
                rule_id: ids.next("rule"),
                network_id: network_id.to_string(),
                name: name.to_string(),
                protocol: protocol.to_string(),
                port,
            };
            r.rules.insert(rule.rule_id.clone(), rule.clone());
            Ok(rule)
        })
    }

    pub fn describe_rules(&self) -> Result<Vec<RuleRecord>> {
        self.call("describe_rules", |r, _| Ok(r.rules.values().cloned().collect()))
    }

    /// The default rule of a network
    pub fn default_rule(&self, network_id: &str) -> Result<RuleRecord> {
        self.call("describe_rules", |r, _| {
            r.rules
                .values()
                .find(|rule| rule.network_id == network_id && rule.is_default())
                .cloned()
                .ok_or_else(|| SimError::not_found("default rule of network", network_id))
        })
    }

    pub fn modify_rule(&self, rule_id: &str, port: u16) -> Result<RuleRecord> {
        self.call("modify_rule", |r, _| {
            let rule = r
                .rules
                .get_mut(rule_id)
                .ok_or_else(|| SimError::not_found("rule", rule_id))?;
            rule.port = port;
            Ok(rule.clone())
        })
    }

    pub fn delete_rule(&self, rule_id: &str) -> Result<()> {
        self.call("delete_rule", |r, _| {
            match r.rules.get(rule_id) {
                None => return Err(SimError::not_found("rule", rule_id)),
                Some(rule) if rule.is_default() => {
                    return Err(SimError::OperationNotPermitted(format!(
                        "rule {} is the default rule of network {}",
                        rule_id, rule.network_id
                    )));
                }
                Some(_) => {}
            }
            r.rules.remove(rule_id);
            Ok(())
        })
    }

    // Load balancers

    pub fn create_load_balancer(&self, name: &str, scheme: &str) -> Result<LoadBalancerRecord> {
        validate_scheme(scheme)?;
        self.call("create_load_balancer", |r, ids| {
            if r.load_balancers.contains_key(name) {
                return Err(SimError::AlreadyExists {
                    kind: "load balancer",
                    name: name.to_string(),
                });
            }
            let lb = LoadBalancerRecord {
                arn: format!("arn:sim:elb:{}", ids.next("lb")),
                name: name.to_string(),
                scheme: scheme.to_string(),
            };
            r.load_balancers.insert(name.to_string(), lb.clone());
            Ok(lb)
        })
    }

    pub fn describe_load_balancers(&self) -> Result<Vec<LoadBalancerRecord>> {
        self.call("describe_load_balancers", |r, _| {
            Ok(r.load_balancers.values().cloned().collect())
        })
    }

    pub fn modify_load_balancer(&self, name: &str, scheme: &str) -> Result<LoadBalancerRecord> {
        validate_scheme(scheme)?;
        self.call("modify_load_balancer", |r, _| {
            let lb = r
                .load_balancers
                .get_mut(name)
                .ok_or_else(|| SimError::not_found("load balancer", name))?;
            lb.scheme = scheme.to_string();
            Ok(lb.clone())
        })
    }

    /// Delete a load balancer and drop its registrations
    pub fn delete_load_balancer(&self, name: &str) -> Result<()> {
        self.call("delete_load_balancer", |r, _| {
            r.load_balancers
                .remove(name)
                .ok_or_else(|| SimError::not_found("load balancer", name))?;
            r.registrations.retain(|(lb, _)| lb != name);
            Ok(())
        })
    }

    // Instances

    /// Launch an instance. It starts out `pending` and becomes `running`
    /// after a few describe calls.
    pub fn run_instance(
        &self,
        name: &str,
        image: &str,
        description: &str,
        subnet_id: &str,
    ) -> Result<InstanceRecord> {
        if image.is_empty() {
            return Err(SimError::InvalidParameter("image must not be empty".to_string()));
        }
        let settle = self.cloud.world().settle_polls;
        self.call("run_instance", |r, ids| {
            if !r.subnets.contains_key(subnet_id) {
                return Err(SimError::InvalidParameter(format!(
                    "subnet {} does not exist",
                    subnet_id
                )));
            }
            let instance = InstanceRecord {
                instance_id: ids.next("i"),
                name: name.to_string(),
                image: image.to_string(),
                description: description.to_string(),
                subnet_id: subnet_id.to_string(),
                state: if settle == 0 {
                    InstanceState::Running
                } else {
                    InstanceState::Pending
                },
                polls: settle,
            };
            r.instances
                .insert(instance.instance_id.clone(), instance.clone());
            Ok(instance)
        })
    }

    /// Describe instances, advancing any in-flight transitions by one poll.
    pub fn describe_instances(&self) -> Result<Vec<InstanceRecord>> {
        self.call("describe_instances", |r, _| {
            for instance in r.instances.values_mut() {
                advance(instance);
            }
            Ok(r.instances.values().cloned().collect())
        })
    }

    pub fn modify_instance(&self, instance_id: &str, name: &str, description: &str) -> Result<InstanceRecord> {
        self.call("modify_instance", |r, _| {
            r.live_instance(instance_id)?;
            let instance = r
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| SimError::not_found("instance", instance_id))?;
            instance.name = name.to_string();
            instance.description = description.to_string();
            Ok(instance.clone())
        })
    }

    /// Begin terminating an instance. It is deregistered from every load
    /// balancer immediately.
    pub fn terminate_instance(&self, instance_id: &str) -> Result<InstanceRecord> {
        let settle = self.cloud.world().settle_polls;
        self.call("terminate_instance", |r, _| {
            r.live_instance(instance_id)?;
            r.registrations.retain(|(_, id)| id != instance_id);
            let instance = r
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| SimError::not_found("instance", instance_id))?;
            if settle == 0 {
                instance.state = InstanceState::Terminated;
            } else {
                instance.state = InstanceState::ShuttingDown;
            }
            instance.polls = settle;
            Ok(instance.clone())
        })
    }

    // Registrations

    pub fn register_instance(&self, load_balancer: &str, instance_id: &str) -> Result<RegistrationRecord> {
        self.call("register_instance", |r, _| {
            if !r.load_balancers.contains_key(load_balancer) {
                return Err(SimError::InvalidParameter(format!(
                    "load balancer {} does not exist",
                    load_balancer
                )));
            }
            let instance = r.live_instance(instance_id).map_err(|_| {
                SimError::InvalidParameter(format!("instance {} does not exist", instance_id))
            })?;
            if instance.state != InstanceState::Running {
                return Err(SimError::NotYetVisible(format!(
                    "instance {} is {}",
                    instance_id, instance.state
                )));
            }
            let registration = (load_balancer.to_string(), instance_id.to_string());
            r.registrations.insert(registration.clone());
            Ok(registration)
        })
    }

    pub fn describe_registrations(&self) -> Result<Vec<RegistrationRecord>> {
        self.call("describe_registrations", |r, _| {
            Ok(r.registrations.iter().cloned().collect())
        })
    }

    pub fn deregister_instance(&self, load_balancer: &str, instance_id: &str) -> Result<()> {
        self.call("deregister_instance", |r, _| {
            let key = (load_balancer.to_string(), instance_id.to_string());
            if r.registrations.remove(&key) {
                Ok(())
            } else {
                Err(SimError::not_found(
                    "registration",
                    format!("{}/{}", load_balancer, instance_id),
                ))
            }
        })
    }
}

fn validate_scheme(scheme: &str) -> Result<()> {
    match scheme {
        "internet-facing" | "internal" => Ok(()),
        other => Err(SimError::InvalidParameter(format!(
            "unknown load balancer scheme '{}'",
            other
        ))),
    }
}

fn advance(instance: &mut InstanceRecord) {
    let next = match instance.state {
        InstanceState::Pending => InstanceState::Running,
        InstanceState::ShuttingDown => InstanceState::Terminated,
        InstanceState::Running | InstanceState::Terminated => return,
    };
    if instance.polls > 0 {
        instance.polls -= 1;
    }
    if instance.polls == 0 {
        instance.state = next;
    }
}

impl std::fmt::Debug for SimSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimSession")
            .field("region", &self.region)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudrow_engine::{Context, EngineError};
    use tempfile::tempdir;

    async fn session(cloud: &SimCloud) -> Arc<SimSession> {
        let ctx = Context::builder("acme")
            .scope(Scope::enabled("us-east-1"))
            .default_credentials(Credentials::new("AKIA", "secret"))
            .build();
        ctx.session(cloud, "us-east-1").await.unwrap()
    }

    #[tokio::test]
    async fn test_network_comes_with_default_rule() {
        let cloud = SimCloud::with_regions(["us-east-1"]);
        let s = session(&cloud).await;

        let net = s.create_network("main", "10.0.0.0/16").unwrap();
        let rule = s.default_rule(&net.network_id).unwrap();
        assert_eq!(rule.name, DEFAULT_RULE);

        let err = s.delete_rule(&rule.rule_id).unwrap_err();
        assert!(matches!(err, SimError::OperationNotPermitted(_)));
    }

    #[tokio::test]
    async fn test_network_delete_waits_for_dependents() {
        let cloud = SimCloud::with_regions(["us-east-1"]);
        let s = session(&cloud).await;

        let net = s.create_network("main", "10.0.0.0/16").unwrap();
        let subnet = s.create_subnet("web", &net.network_id, "10.0.1.0/24").unwrap();

        let err = s.delete_network(&net.network_id).unwrap_err();
        assert!(matches!(err, SimError::DependencyViolation(_)));

        s.delete_subnet(&subnet.subnet_id).unwrap();
        s.delete_network(&net.network_id).unwrap();
        assert!(s.describe_rules().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_instance_lifecycle() {
        let cloud = SimCloud::with_regions(["us-east-1"]);
        cloud.set_settle_polls(2);
        let s = session(&cloud).await;

        let net = s.create_network("main", "10.0.0.0/16").unwrap();
        let subnet = s.create_subnet("web", &net.network_id, "10.0.1.0/24").unwrap();
        let lb = s.create_load_balancer("front", "internet-facing").unwrap();
        let instance = s.run_instance("web-1", "img-a", "web", &subnet.subnet_id).unwrap();
        assert_eq!(instance.state, InstanceState::Pending);

        let err = s.register_instance(&lb.name, &instance.instance_id).unwrap_err();
        assert!(matches!(err, SimError::NotYetVisible(_)));

        s.describe_instances().unwrap();
        let described = s.describe_instances().unwrap();
        assert_eq!(described[0].state, InstanceState::Running);

        s.register_instance(&lb.name, &instance.instance_id).unwrap();
        s.terminate_instance(&instance.instance_id).unwrap();
        assert!(s.describe_registrations().unwrap().is_empty());

        s.describe_instances().unwrap();
        let described = s.describe_instances().unwrap();
        assert_eq!(described[0].state, InstanceState::Terminated);
        assert!(s.terminate_instance(&instance.instance_id).is_err());
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let cloud = SimCloud::with_regions(["us-east-1"]);
        let s = session(&cloud).await;

        cloud.fail_next("describe_networks", SimError::Throttled("slow down".into()));
        assert!(matches!(
            s.describe_networks(),
            Err(SimError::Throttled(_))
        ));
        assert!(s.describe_networks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_checks_region_and_credentials() {
        let cloud = SimCloud::with_regions(["us-east-1"]);
        let creds = Credentials::new("AKIA", "secret");

        let err = cloud
            .connect(&Scope::enabled("moon-1"), &creds)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = cloud
            .connect(&Scope::enabled("us-east-1"), &Credentials::new("AKIA", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AuthenticationFailed(_)));

        cloud
            .connect(&Scope::enabled("us-east-1"), &creds)
            .await
            .unwrap();
        assert_eq!(cloud.connects(), 1);
    }

    #[test]
    fn test_cidr_validation() {
        assert!(validate_cidr("10.0.0.0/16").is_ok());
        assert!(validate_cidr("10.0.0/16").is_err());
        assert!(validate_cidr("10.0.0.0/33").is_err());
        assert!(validate_cidr("10.0.0.0").is_err());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("cloud.json");

        let cloud = SimCloud::with_regions(["us-east-1", "eu-west-1"]);
        cloud.add_default_network("us-east-1", "172.31.0.0/16").unwrap();
        cloud.save(&path).await.unwrap();

        let loaded = SimCloud::load(&path).await.unwrap();
        assert_eq!(loaded.regions(), vec!["eu-west-1", "us-east-1"]);
        let networks = loaded.inspect(|w| w.regions["us-east-1"].networks.len());
        assert_eq!(networks, 1);
    }
}
