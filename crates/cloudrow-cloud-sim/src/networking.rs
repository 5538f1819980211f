//! `networking` module: networks, subnets and firewall rules

use crate::cloud::{DEFAULT_RULE, NetworkRecord, RuleRecord, SimCloud, SimSession, SubnetRecord};
use crate::lookup::{assigned, resolve, scan};
use crate::store::{Regional, TableBackend, TableStore};
use async_trait::async_trait;
use cloudrow_engine::{
    AnyMapper, Backend, Context, EngineError, Entity, IdFields, IdentityCodec, Mapper, Module,
    Relation, Result, RowId, UpdateOrReplace, erase, fields_from,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const NETWORK: IdentityCodec = IdentityCodec::new("network", &["region", "network_id"]);
pub const SUBNET: IdentityCodec = IdentityCodec::new("subnet", &["region", "name"]);
pub const FIREWALL_RULE: IdentityCodec = IdentityCodec::new("firewall_rule", &["region", "rule_id"]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    #[serde(skip)]
    pub row: Option<RowId>,
    pub region: String,
    /// Assigned by the provider
    #[serde(default)]
    pub network_id: Option<String>,
    pub name: String,
    pub cidr: String,
    /// The region's implicit default network
    #[serde(default)]
    pub is_default: bool,
}

impl Network {
    pub fn new(region: impl Into<String>, name: impl Into<String>, cidr: impl Into<String>) -> Self {
        Self {
            row: None,
            region: region.into(),
            network_id: None,
            name: name.into(),
            cidr: cidr.into(),
            is_default: false,
        }
    }

    fn observed(region: &str, record: NetworkRecord) -> Self {
        Self {
            row: None,
            region: region.to_string(),
            network_id: Some(record.network_id),
            name: record.name,
            cidr: record.cidr,
            is_default: record.is_default,
        }
    }
}

impl Entity for Network {
    fn identity(&self) -> Option<IdFields> {
        self.network_id.as_ref().map(|id| {
            fields_from([("region", self.region.as_str()), ("network_id", id.as_str())])
        })
    }

    fn row_id(&self) -> Option<RowId> {
        self.row
    }

    fn set_row_id(&mut self, row: Option<RowId>) {
        self.row = row;
    }
}

impl Regional for Network {
    fn region(&self) -> &str {
        &self.region
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    #[serde(skip)]
    pub row: Option<RowId>,
    pub region: String,
    pub name: String,
    pub network: Relation,
    pub cidr: String,
    #[serde(default)]
    pub subnet_id: Option<String>,
}

impl Subnet {
    pub fn new(
        region: impl Into<String>,
        name: impl Into<String>,
        network: Relation,
        cidr: impl Into<String>,
    ) -> Self {
        Self {
            row: None,
            region: region.into(),
            name: name.into(),
            network,
            cidr: cidr.into(),
            subnet_id: None,
        }
    }

    fn observed(region: &str, record: SubnetRecord) -> Result<Self> {
        Ok(Self {
            row: None,
            region: region.to_string(),
            name: record.name,
            network: network_relation(region, &record.network_id)?,
            cidr: record.cidr,
            subnet_id: Some(record.subnet_id),
        })
    }
}

impl Entity for Subnet {
    fn identity(&self) -> Option<IdFields> {
        Some(fields_from([("region", self.region.as_str()), ("name", self.name.as_str())]))
    }

    fn row_id(&self) -> Option<RowId> {
        self.row
    }

    fn set_row_id(&mut self, row: Option<RowId>) {
        self.row = row;
    }
}

impl Regional for Subnet {
    fn region(&self) -> &str {
        &self.region
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(skip)]
    pub row: Option<RowId>,
    pub region: String,
    #[serde(default)]
    pub rule_id: Option<String>,
    pub network: Relation,
    pub name: String,
    pub protocol: String,
    pub port: u16,
}

impl FirewallRule {
    pub fn new(
        region: impl Into<String>,
        network: Relation,
        name: impl Into<String>,
        protocol: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            row: None,
            region: region.into(),
            rule_id: None,
            network,
            name: name.into(),
            protocol: protocol.into(),
            port,
        }
    }

    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_RULE
    }

    fn observed(region: &str, record: RuleRecord) -> Result<Self> {
        Ok(Self {
            row: None,
            region: region.to_string(),
            rule_id: Some(record.rule_id),
            network: network_relation(region, &record.network_id)?,
            name: record.name,
            protocol: record.protocol,
            port: record.port,
        })
    }
}

impl Entity for FirewallRule {
    fn identity(&self) -> Option<IdFields> {
        self.rule_id
            .as_ref()
            .map(|id| fields_from([("region", self.region.as_str()), ("rule_id", id.as_str())]))
    }

    fn row_id(&self) -> Option<RowId> {
        self.row
    }

    fn set_row_id(&mut self, row: Option<RowId>) {
        self.row = row;
    }
}

impl Regional for FirewallRule {
    fn region(&self) -> &str {
        &self.region
    }
}

fn network_relation(region: &str, network_id: &str) -> Result<Relation> {
    let id = NETWORK.generate_id(&fields_from([("region", region), ("network_id", network_id)]))?;
    Ok(Relation::new(NETWORK.kind(), id))
}

fn describe_networks(session: &SimSession) -> Result<Vec<Network>> {
    Ok(session
        .describe_networks()?
        .into_iter()
        .map(|record| Network::observed(session.region(), record))
        .collect())
}

fn describe_subnets(session: &SimSession) -> Result<Vec<Subnet>> {
    session
        .describe_subnets()?
        .into_iter()
        .map(|record| Subnet::observed(session.region(), record))
        .collect()
}

fn describe_rules(session: &SimSession) -> Result<Vec<FirewallRule>> {
    session
        .describe_rules()?
        .into_iter()
        .map(|record| FirewallRule::observed(session.region(), record))
        .collect()
}

// Provider backends

#[derive(Clone)]
pub struct NetworkCloud {
    sim: SimCloud,
}

#[async_trait]
impl Backend<Network> for NetworkCloud {
    async fn create(&self, ctx: &Context, entities: Vec<Network>) -> Result<Vec<Network>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            let session = ctx.session(&self.sim, &e.region).await?;
            let record = session.create_network(&e.name, &e.cidr)?;
            tracing::info!("Created network {} ({}) in {}", record.name, record.network_id, e.region);
            out.push(Network::observed(&e.region, record));
        }
        Ok(out)
    }

    async fn read(&self, ctx: &Context, id: Option<&str>) -> Result<Vec<Network>> {
        scan(ctx, &self.sim, &NETWORK, id, |session| async move { describe_networks(&session) }).await
    }

    async fn update(&self, ctx: &Context, entities: Vec<Network>) -> Result<Vec<Network>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            let network_id = assigned(&NETWORK, "network_id", &e.network_id)?;
            let session = ctx.session(&self.sim, &e.region).await?;
            let record = session.modify_network(network_id, &e.name, &e.cidr)?;
            out.push(Network::observed(&e.region, record));
        }
        Ok(out)
    }

    async fn delete(&self, ctx: &Context, entities: Vec<Network>) -> Result<()> {
        for e in entities {
            let network_id = assigned(&NETWORK, "network_id", &e.network_id)?;
            let session = ctx.session(&self.sim, &e.region).await?;
            session.delete_network(network_id)?;
            tracing::info!("Deleted network {} in {}", network_id, e.region);
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct SubnetCloud {
    sim: SimCloud,
    networks: NetworkCloud,
}

impl SubnetCloud {
    pub fn new(sim: SimCloud) -> Self {
        Self {
            networks: NetworkCloud { sim: sim.clone() },
            sim,
        }
    }

    async fn network_id(&self, ctx: &Context, subnet: &Subnet) -> Result<String> {
        let network = resolve(ctx, &self.networks, &NETWORK, &subnet.network).await?;
        Ok(assigned(&NETWORK, "network_id", &network.network_id)?.to_string())
    }
}

#[async_trait]
impl Backend<Subnet> for SubnetCloud {
    async fn create(&self, ctx: &Context, entities: Vec<Subnet>) -> Result<Vec<Subnet>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            let network_id = self.network_id(ctx, &e).await?;
            let session = ctx.session(&self.sim, &e.region).await?;
            let record = session.create_subnet(&e.name, &network_id, &e.cidr)?;
            tracing::info!("Created subnet {} ({}) in {}", record.name, record.subnet_id, e.region);
            out.push(Subnet::observed(&e.region, record)?);
        }
        Ok(out)
    }

    async fn read(&self, ctx: &Context, id: Option<&str>) -> Result<Vec<Subnet>> {
        scan(ctx, &self.sim, &SUBNET, id, |session| async move { describe_subnets(&session) }).await
    }

    async fn update(&self, ctx: &Context, entities: Vec<Subnet>) -> Result<Vec<Subnet>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            let network_id = self.network_id(ctx, &e).await?;
            let session = ctx.session(&self.sim, &e.region).await?;
            let subnet_id = match &e.subnet_id {
                Some(id) => id.clone(),
                None => session
                    .describe_subnets()?
                    .into_iter()
                    .find(|s| s.name == e.name)
                    .map(|s| s.subnet_id)
                    .ok_or_else(|| EngineError::NotFound(format!("subnet {}", e.name)))?,
            };
            let record = session.modify_subnet(&subnet_id, &network_id, &e.cidr)?;
            out.push(Subnet::observed(&e.region, record)?);
        }
        Ok(out)
    }

    async fn delete(&self, ctx: &Context, entities: Vec<Subnet>) -> Result<()> {
        for e in entities {
            let subnet_id = assigned(&SUBNET, "subnet_id", &e.subnet_id)?;
            let session = ctx.session(&self.sim, &e.region).await?;
            session.delete_subnet(subnet_id)?;
            tracing::info!("Deleted subnet {} in {}", e.name, e.region);
        }
        Ok(())
    }
}

/// Firewall rules, including each network's implicit default rule.
///
/// The default rule comes and goes with its network. It cannot be created
/// or modified, and deleting it while its network is still declared is
/// refused so the engine restores it into the declared state instead.
#[derive(Clone)]
pub struct FirewallRuleCloud {
    sim: SimCloud,
    networks: NetworkCloud,
    declared_networks: TableBackend<Network>,
}

impl FirewallRuleCloud {
    async fn network_id(&self, ctx: &Context, rule: &FirewallRule) -> Result<String> {
        let network = resolve(ctx, &self.networks, &NETWORK, &rule.network).await?;
        Ok(assigned(&NETWORK, "network_id", &network.network_id)?.to_string())
    }
}

#[async_trait]
impl Backend<FirewallRule> for FirewallRuleCloud {
    async fn create(&self, ctx: &Context, entities: Vec<FirewallRule>) -> Result<Vec<FirewallRule>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            if e.is_default() {
                return Err(EngineError::Validation(format!(
                    "the '{}' rule of {} is created with its network and cannot be declared",
                    DEFAULT_RULE, e.network
                )));
            }
            let network_id = self.network_id(ctx, &e).await?;
            let session = ctx.session(&self.sim, &e.region).await?;
            let record = session.create_rule(&network_id, &e.name, &e.protocol, e.port)?;
            tracing::info!("Created firewall rule {} ({}) in {}", record.name, record.rule_id, e.region);
            out.push(FirewallRule::observed(&e.region, record)?);
        }
        Ok(out)
    }

    async fn read(&self, ctx: &Context, id: Option<&str>) -> Result<Vec<FirewallRule>> {
        scan(ctx, &self.sim, &FIREWALL_RULE, id, |session| async move { describe_rules(&session) })
            .await
    }

    async fn update(&self, ctx: &Context, entities: Vec<FirewallRule>) -> Result<Vec<FirewallRule>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            let rule_id = assigned(&FIREWALL_RULE, "rule_id", &e.rule_id)?;
            if e.is_default() {
                return Err(EngineError::PolicyViolation(format!(
                    "default rule {} cannot be modified",
                    rule_id
                )));
            }
            let session = ctx.session(&self.sim, &e.region).await?;
            let record = session.modify_rule(rule_id, e.port)?;
            out.push(FirewallRule::observed(&e.region, record)?);
        }
        Ok(out)
    }

    async fn delete(&self, ctx: &Context, entities: Vec<FirewallRule>) -> Result<()> {
        for e in entities {
            let rule_id = assigned(&FIREWALL_RULE, "rule_id", &e.rule_id)?;
            if e.is_default() {
                let declared = self.declared_networks.read(ctx, Some(&e.network.id)).await?;
                if !declared.is_empty() {
                    return Err(EngineError::PolicyViolation(format!(
                        "default rule {} belongs to declared network {}",
                        rule_id, e.network.id
                    )));
                }
                tracing::debug!("Leaving default rule {} to be removed with its network", rule_id);
                continue;
            }
            let session = ctx.session(&self.sim, &e.region).await?;
            session.delete_rule(rule_id)?;
            tracing::info!("Deleted firewall rule {} in {}", rule_id, e.region);
        }
        Ok(())
    }
}

// Mappers

pub struct NetworkMapper {
    db: TableBackend<Network>,
    cloud: NetworkCloud,
}

impl Mapper for NetworkMapper {
    type Entity = Network;

    fn codec(&self) -> &IdentityCodec {
        &NETWORK
    }

    fn db(&self) -> &dyn Backend<Network> {
        &self.db
    }

    fn cloud(&self) -> &dyn Backend<Network> {
        &self.cloud
    }

    fn equals(&self, a: &Network, b: &Network) -> bool {
        a.region == b.region && a.name == b.name && a.cidr == b.cidr
    }

    fn is_protected(&self, entity: &Network) -> bool {
        entity.is_default
    }
}

pub struct SubnetMapper {
    db: TableBackend<Subnet>,
    cloud: SubnetCloud,
}

impl Mapper for SubnetMapper {
    type Entity = Subnet;

    fn codec(&self) -> &IdentityCodec {
        &SUBNET
    }

    fn db(&self) -> &dyn Backend<Subnet> {
        &self.db
    }

    fn cloud(&self) -> &dyn Backend<Subnet> {
        &self.cloud
    }

    fn equals(&self, a: &Subnet, b: &Subnet) -> bool {
        a.region == b.region && a.name == b.name && a.network == b.network && a.cidr == b.cidr
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["network"]
    }

    fn relations(&self, entity: &Subnet) -> Vec<Relation> {
        vec![entity.network.clone()]
    }

    fn repoint(&self, entity: &mut Subnet, from: &Relation, to_id: &str) -> bool {
        if entity.network != *from {
            return false;
        }
        entity.network.id = to_id.to_string();
        true
    }
}

pub struct FirewallRuleMapper {
    db: TableBackend<FirewallRule>,
    cloud: FirewallRuleCloud,
}

impl Mapper for FirewallRuleMapper {
    type Entity = FirewallRule;

    fn codec(&self) -> &IdentityCodec {
        &FIREWALL_RULE
    }

    fn db(&self) -> &dyn Backend<FirewallRule> {
        &self.db
    }

    fn cloud(&self) -> &dyn Backend<FirewallRule> {
        &self.cloud
    }

    fn equals(&self, a: &FirewallRule, b: &FirewallRule) -> bool {
        a.region == b.region
            && a.network == b.network
            && a.name == b.name
            && a.protocol == b.protocol
            && a.port == b.port
    }

    /// Only the port can change in place
    fn update_or_replace(&self, prev: &FirewallRule, next: &FirewallRule) -> UpdateOrReplace {
        if prev.is_default() {
            return UpdateOrReplace::Update;
        }
        if prev.network != next.network || prev.name != next.name || prev.protocol != next.protocol {
            UpdateOrReplace::Replace
        } else {
            UpdateOrReplace::Update
        }
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["network"]
    }

    fn relations(&self, entity: &FirewallRule) -> Vec<Relation> {
        vec![entity.network.clone()]
    }

    fn repoint(&self, entity: &mut FirewallRule, from: &Relation, to_id: &str) -> bool {
        if entity.network != *from {
            return false;
        }
        entity.network.id = to_id.to_string();
        true
    }
}

/// Networks, subnets and firewall rules
pub struct Networking {
    sim: SimCloud,
    store: Arc<TableStore>,
}

impl Networking {
    pub fn new(sim: SimCloud, store: Arc<TableStore>) -> Self {
        Self { sim, store }
    }

    fn network_cloud(&self) -> NetworkCloud {
        NetworkCloud {
            sim: self.sim.clone(),
        }
    }
}

impl Module for Networking {
    fn name(&self) -> &'static str {
        "networking"
    }

    fn mappers(&self) -> Vec<Arc<dyn AnyMapper>> {
        vec![
            erase(NetworkMapper {
                db: TableBackend::new(self.store.clone(), NETWORK),
                cloud: self.network_cloud(),
            }),
            erase(SubnetMapper {
                db: TableBackend::new(self.store.clone(), SUBNET),
                cloud: SubnetCloud {
                    sim: self.sim.clone(),
                    networks: self.network_cloud(),
                },
            }),
            erase(FirewallRuleMapper {
                db: TableBackend::new(self.store.clone(), FIREWALL_RULE),
                cloud: FirewallRuleCloud {
                    sim: self.sim.clone(),
                    networks: self.network_cloud(),
                    declared_networks: TableBackend::new(self.store.clone(), NETWORK),
                },
            }),
        ]
    }
}
