//! `compute` module: load balancers, instances and their registrations

use crate::cloud::{InstanceRecord, InstanceState, LoadBalancerRecord, SimCloud, SimSession};
use crate::lookup::{assigned, resolve, scan};
use crate::networking::{SUBNET, Subnet, SubnetCloud};
use crate::store::{Regional, TableBackend, TableStore};
use async_trait::async_trait;
use cloudrow_engine::{
    AnyMapper, Backend, Context, Entity, IdFields, IdentityCodec, Mapper, Module, OrphanPolicy,
    Relation, Result, RowId, UpdateOrReplace, WaitConfig, WaitOutcome, erase, fields_from,
    wait_until,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const LOAD_BALANCER: IdentityCodec = IdentityCodec::new("load_balancer", &["region", "name"]);
pub const INSTANCE: IdentityCodec = IdentityCodec::new("instance", &["region", "instance_id"]);
pub const REGISTRATION: IdentityCodec =
    IdentityCodec::new("registration", &["region", "load_balancer", "instance"]);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancer {
    #[serde(skip)]
    pub row: Option<RowId>,
    pub region: String,
    pub name: String,
    pub scheme: String,
    #[serde(default)]
    pub arn: Option<String>,
}

impl LoadBalancer {
    pub fn new(region: impl Into<String>, name: impl Into<String>, scheme: impl Into<String>) -> Self {
        Self {
            row: None,
            region: region.into(),
            name: name.into(),
            scheme: scheme.into(),
            arn: None,
        }
    }

    fn observed(region: &str, record: LoadBalancerRecord) -> Self {
        Self {
            row: None,
            region: region.to_string(),
            name: record.name,
            scheme: record.scheme,
            arn: Some(record.arn),
        }
    }
}

impl Entity for LoadBalancer {
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

impl Regional for LoadBalancer {
    fn region(&self) -> &str {
        &self.region
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(skip)]
    pub row: Option<RowId>,
    pub region: String,
    /// Assigned by the provider at launch
    #[serde(default)]
    pub instance_id: Option<String>,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub description: String,
    pub subnet: Relation,
    #[serde(default)]
    pub state: Option<InstanceState>,
}

impl Instance {
    pub fn new(
        region: impl Into<String>,
        name: impl Into<String>,
        image: impl Into<String>,
        subnet: Relation,
    ) -> Self {
        Self {
            row: None,
            region: region.into(),
            instance_id: None,
            name: name.into(),
            image: image.into(),
            description: String::new(),
            subnet,
            state: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    fn observed(region: &str, record: InstanceRecord, subnet: Relation) -> Self {
        Self {
            row: None,
            region: region.to_string(),
            instance_id: Some(record.instance_id),
            name: record.name,
            image: record.image,
            description: record.description,
            subnet,
            state: Some(record.state),
        }
    }
}

impl Entity for Instance {
    fn identity(&self) -> Option<IdFields> {
        self.instance_id.as_ref().map(|id| {
            fields_from([("region", self.region.as_str()), ("instance_id", id.as_str())])
        })
    }

    fn row_id(&self) -> Option<RowId> {
        self.row
    }

    fn set_row_id(&mut self, row: Option<RowId>) {
        self.row = row;
    }
}

impl Regional for Instance {
    fn region(&self) -> &str {
        &self.region
    }
}

/// An instance serving behind a load balancer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(skip)]
    pub row: Option<RowId>,
    pub region: String,
    pub load_balancer: Relation,
    pub instance: Relation,
}

impl Registration {
    pub fn new(region: impl Into<String>, load_balancer: Relation, instance: Relation) -> Self {
        Self {
            row: None,
            region: region.into(),
            load_balancer,
            instance,
        }
    }
}

impl Entity for Registration {
    fn identity(&self) -> Option<IdFields> {
        Some(fields_from([
            ("region", self.region.as_str()),
            ("load_balancer", self.load_balancer.id.as_str()),
            ("instance", self.instance.id.as_str()),
        ]))
    }

    fn row_id(&self) -> Option<RowId> {
        self.row
    }

    fn set_row_id(&mut self, row: Option<RowId>) {
        self.row = row;
    }
}

impl Regional for Registration {
    fn region(&self) -> &str {
        &self.region
    }
}

fn relation(codec: &IdentityCodec, fields: [(&str, &str); 2]) -> Result<Relation> {
    Ok(Relation::new(codec.kind(), codec.generate_id(&fields_from(fields))?))
}

fn describe_load_balancers(session: &SimSession) -> Result<Vec<LoadBalancer>> {
    Ok(session
        .describe_load_balancers()?
        .into_iter()
        .map(|record| LoadBalancer::observed(session.region(), record))
        .collect())
}

/// Live instances, with subnet ids translated into subnet relations
fn describe_instances(session: &SimSession) -> Result<Vec<Instance>> {
    let region = session.region();
    let subnets: HashMap<String, String> = session
        .describe_subnets()?
        .into_iter()
        .map(|s| (s.subnet_id, s.name))
        .collect();

    let mut out = Vec::new();
    for record in session.describe_instances()? {
        if !record.is_live() {
            continue;
        }
        let subnet_name = subnets.get(&record.subnet_id).unwrap_or(&record.subnet_id).clone();
        let subnet = relation(&SUBNET, [("region", region), ("name", subnet_name.as_str())])?;
        out.push(Instance::observed(region, record, subnet));
    }
    Ok(out)
}

fn describe_registrations(session: &SimSession) -> Result<Vec<Registration>> {
    let region = session.region();
    session
        .describe_registrations()?
        .into_iter()
        .map(|(load_balancer, instance_id)| -> Result<Registration> {
            Ok(Registration::new(
                region,
                relation(&LOAD_BALANCER, [("region", region), ("name", load_balancer.as_str())])?,
                relation(&INSTANCE, [("region", region), ("instance_id", instance_id.as_str())])?,
            ))
        })
        .collect()
}

/// Poll one instance, advancing its lifecycle
fn find_instance(session: &SimSession, instance_id: &str) -> Result<Option<InstanceRecord>> {
    Ok(session
        .describe_instances()?
        .into_iter()
        .find(|i| i.instance_id == instance_id))
}

// Provider backends

#[derive(Clone)]
pub struct LoadBalancerCloud {
    sim: SimCloud,
}

#[async_trait]
impl Backend<LoadBalancer> for LoadBalancerCloud {
    async fn create(&self, ctx: &Context, entities: Vec<LoadBalancer>) -> Result<Vec<LoadBalancer>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            let session = ctx.session(&self.sim, &e.region).await?;
            let record = session.create_load_balancer(&e.name, &e.scheme)?;
            tracing::info!("Created load balancer {} in {}", record.name, e.region);
            out.push(LoadBalancer::observed(&e.region, record));
        }
        Ok(out)
    }

    async fn read(&self, ctx: &Context, id: Option<&str>) -> Result<Vec<LoadBalancer>> {
        scan(ctx, &self.sim, &LOAD_BALANCER, id, |session| async move {
            describe_load_balancers(&session)
        })
        .await
    }

    async fn update(&self, ctx: &Context, entities: Vec<LoadBalancer>) -> Result<Vec<LoadBalancer>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            let session = ctx.session(&self.sim, &e.region).await?;
            let record = session.modify_load_balancer(&e.name, &e.scheme)?;
            out.push(LoadBalancer::observed(&e.region, record));
        }
        Ok(out)
    }

    async fn delete(&self, ctx: &Context, entities: Vec<LoadBalancer>) -> Result<()> {
        for e in entities {
            let session = ctx.session(&self.sim, &e.region).await?;
            session.delete_load_balancer(&e.name)?;
            tracing::info!("Deleted load balancer {} in {}", e.name, e.region);
        }
        Ok(())
    }
}

/// Instances launch and terminate asynchronously. Create returns once the
/// launch is accepted and settling waits for it to run; delete waits for
/// the termination to finish.
#[derive(Clone)]
pub struct InstanceCloud {
    sim: SimCloud,
    subnets: SubnetCloud,
    wait: WaitConfig,
}

impl InstanceCloud {
    async fn launch(&self, ctx: &Context, e: &Instance) -> Result<Instance> {
        let subnet: Subnet = resolve(ctx, &self.subnets, &SUBNET, &e.subnet).await?;
        let subnet_id = assigned(&SUBNET, "subnet_id", &subnet.subnet_id)?;
        let session = ctx.session(&self.sim, &e.region).await?;
        let launched = session.run_instance(&e.name, &e.image, &e.description, subnet_id)?;
        tracing::info!("Launched instance {} ({}) in {}", e.name, launched.instance_id, e.region);
        Ok(Instance::observed(&e.region, launched, e.subnet.clone()))
    }

    async fn wait_running(&self, ctx: &Context, e: Instance) -> Result<Instance> {
        let instance_id = assigned(&INSTANCE, "instance_id", &e.instance_id)?.to_string();
        let session = ctx.session(&self.sim, &e.region).await?;

        let what = format!("instance {} to start", instance_id);
        let record = wait_until(ctx, &self.wait, &what, || {
            let session = session.clone();
            let instance_id = instance_id.clone();
            async move {
                find_instance(&session, &instance_id).map(|found| match found {
                    Some(i) if i.state == InstanceState::Running => WaitOutcome::Ready(i),
                    Some(i) if i.state == InstanceState::Pending => WaitOutcome::Pending,
                    Some(i) => WaitOutcome::Failed(format!("instance is {}", i.state)),
                    None => WaitOutcome::Failed("instance disappeared".to_string()),
                })
            }
        })
        .await?;

        let mut running = Instance::observed(&e.region, record, e.subnet.clone());
        running.row = e.row;
        Ok(running)
    }

    async fn terminate(&self, ctx: &Context, e: &Instance) -> Result<()> {
        let instance_id = assigned(&INSTANCE, "instance_id", &e.instance_id)?.to_string();
        let session = ctx.session(&self.sim, &e.region).await?;
        session.terminate_instance(&instance_id)?;

        let what = format!("instance {} to terminate", instance_id);
        wait_until(ctx, &self.wait, &what, || {
            let session = session.clone();
            let instance_id = instance_id.clone();
            async move {
                find_instance(&session, &instance_id).map(|found| match found {
                    Some(i) if i.state != InstanceState::Terminated => WaitOutcome::Pending,
                    _ => WaitOutcome::Ready(()),
                })
            }
        })
        .await?;

        tracing::info!("Terminated instance {} in {}", instance_id, e.region);
        Ok(())
    }
}

#[async_trait]
impl Backend<Instance> for InstanceCloud {
    async fn create(&self, ctx: &Context, entities: Vec<Instance>) -> Result<Vec<Instance>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in &entities {
            out.push(self.launch(ctx, e).await?);
        }
        Ok(out)
    }

    async fn settle(&self, ctx: &Context, entity: Instance) -> Result<Instance> {
        self.wait_running(ctx, entity).await
    }

    async fn read(&self, ctx: &Context, id: Option<&str>) -> Result<Vec<Instance>> {
        scan(ctx, &self.sim, &INSTANCE, id, |session| async move { describe_instances(&session) })
            .await
    }

    async fn update(&self, ctx: &Context, entities: Vec<Instance>) -> Result<Vec<Instance>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            let instance_id = assigned(&INSTANCE, "instance_id", &e.instance_id)?;
            let session = ctx.session(&self.sim, &e.region).await?;
            let record = session.modify_instance(instance_id, &e.name, &e.description)?;
            out.push(Instance::observed(&e.region, record, e.subnet.clone()));
        }
        Ok(out)
    }

    async fn delete(&self, ctx: &Context, entities: Vec<Instance>) -> Result<()> {
        for e in &entities {
            self.terminate(ctx, e).await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RegistrationCloud {
    sim: SimCloud,
    load_balancers: LoadBalancerCloud,
    instances: InstanceCloud,
}

#[async_trait]
impl Backend<Registration> for RegistrationCloud {
    async fn create(&self, ctx: &Context, entities: Vec<Registration>) -> Result<Vec<Registration>> {
        let mut out = Vec::with_capacity(entities.len());
        for e in entities {
            let lb = resolve(ctx, &self.load_balancers, &LOAD_BALANCER, &e.load_balancer).await?;
            let instance = resolve(ctx, &self.instances, &INSTANCE, &e.instance).await?;
            let instance_id = assigned(&INSTANCE, "instance_id", &instance.instance_id)?;
            let session = ctx.session(&self.sim, &e.region).await?;
            session.register_instance(&lb.name, instance_id)?;
            tracing::info!("Registered {} with load balancer {}", instance_id, lb.name);
            out.push(e);
        }
        Ok(out)
    }

    async fn read(&self, ctx: &Context, id: Option<&str>) -> Result<Vec<Registration>> {
        scan(ctx, &self.sim, &REGISTRATION, id, |session| async move {
            describe_registrations(&session)
        })
        .await
    }

    /// Every field is part of the identity, so there is nothing to update
    async fn update(&self, _ctx: &Context, entities: Vec<Registration>) -> Result<Vec<Registration>> {
        Ok(entities)
    }

    async fn delete(&self, ctx: &Context, entities: Vec<Registration>) -> Result<()> {
        for e in entities {
            let fields = INSTANCE.id_fields(&e.instance.id)?;
            let lb_fields = LOAD_BALANCER.id_fields(&e.load_balancer.id)?;
            let session = ctx.session(&self.sim, &e.region).await?;
            session.deregister_instance(&lb_fields["name"], &fields["instance_id"])?;
            tracing::info!(
                "Deregistered {} from load balancer {}",
                fields["instance_id"],
                lb_fields["name"]
            );
        }
        Ok(())
    }
}

// Mappers

pub struct LoadBalancerMapper {
    db: TableBackend<LoadBalancer>,
    cloud: LoadBalancerCloud,
}

impl Mapper for LoadBalancerMapper {
    type Entity = LoadBalancer;

    fn codec(&self) -> &IdentityCodec {
        &LOAD_BALANCER
    }

    fn db(&self) -> &dyn Backend<LoadBalancer> {
        &self.db
    }

    fn cloud(&self) -> &dyn Backend<LoadBalancer> {
        &self.cloud
    }

    fn equals(&self, a: &LoadBalancer, b: &LoadBalancer) -> bool {
        a.region == b.region && a.name == b.name && a.scheme == b.scheme
    }
}

pub struct InstanceMapper {
    db: TableBackend<Instance>,
    cloud: InstanceCloud,
}

impl Mapper for InstanceMapper {
    type Entity = Instance;

    fn codec(&self) -> &IdentityCodec {
        &INSTANCE
    }

    fn db(&self) -> &dyn Backend<Instance> {
        &self.db
    }

    fn cloud(&self) -> &dyn Backend<Instance> {
        &self.cloud
    }

    fn equals(&self, a: &Instance, b: &Instance) -> bool {
        a.region == b.region
            && a.name == b.name
            && a.image == b.image
            && a.description == b.description
            && a.subnet == b.subnet
    }

    /// The image and subnet are fixed at launch
    fn update_or_replace(&self, prev: &Instance, next: &Instance) -> UpdateOrReplace {
        if prev.image != next.image || prev.subnet != next.subnet {
            UpdateOrReplace::Replace
        } else {
            UpdateOrReplace::Update
        }
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["subnet"]
    }

    fn relations(&self, entity: &Instance) -> Vec<Relation> {
        vec![entity.subnet.clone()]
    }

    fn repoint(&self, entity: &mut Instance, from: &Relation, to_id: &str) -> bool {
        if entity.subnet != *from {
            return false;
        }
        entity.subnet.id = to_id.to_string();
        true
    }
}

pub struct RegistrationMapper {
    db: TableBackend<Registration>,
    cloud: RegistrationCloud,
}

impl Mapper for RegistrationMapper {
    type Entity = Registration;

    fn codec(&self) -> &IdentityCodec {
        &REGISTRATION
    }

    fn db(&self) -> &dyn Backend<Registration> {
        &self.db
    }

    fn cloud(&self) -> &dyn Backend<Registration> {
        &self.cloud
    }

    fn equals(&self, a: &Registration, b: &Registration) -> bool {
        a.region == b.region && a.load_balancer == b.load_balancer && a.instance == b.instance
    }

    /// Registrations are owned by the declared state
    fn orphan_policy(&self) -> OrphanPolicy {
        OrphanPolicy::Prune
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &["load_balancer", "instance"]
    }

    fn relations(&self, entity: &Registration) -> Vec<Relation> {
        vec![entity.load_balancer.clone(), entity.instance.clone()]
    }

    fn repoint(&self, entity: &mut Registration, from: &Relation, to_id: &str) -> bool {
        let target = if entity.instance == *from {
            &mut entity.instance
        } else if entity.load_balancer == *from {
            &mut entity.load_balancer
        } else {
            return false;
        };
        target.id = to_id.to_string();
        true
    }
}

/// Load balancers, instances and registrations
pub struct Compute {
    sim: SimCloud,
    store: Arc<TableStore>,
    wait: WaitConfig,
}

impl Compute {
    pub fn new(sim: SimCloud, store: Arc<TableStore>) -> Self {
        Self {
            sim,
            store,
            wait: WaitConfig::default(),
        }
    }

    /// Polling used while instances start and terminate
    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    fn load_balancer_cloud(&self) -> LoadBalancerCloud {
        LoadBalancerCloud {
            sim: self.sim.clone(),
        }
    }

    fn instance_cloud(&self) -> InstanceCloud {
        InstanceCloud {
            sim: self.sim.clone(),
            subnets: SubnetCloud::new(self.sim.clone()),
            wait: self.wait.clone(),
        }
    }
}

impl Module for Compute {
    fn name(&self) -> &'static str {
        "compute"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["networking"]
    }

    fn mappers(&self) -> Vec<Arc<dyn AnyMapper>> {
        vec![
            erase(LoadBalancerMapper {
                db: TableBackend::new(self.store.clone(), LOAD_BALANCER),
                cloud: self.load_balancer_cloud(),
            }),
            erase(InstanceMapper {
                db: TableBackend::new(self.store.clone(), INSTANCE),
                cloud: self.instance_cloud(),
            }),
            erase(RegistrationMapper {
                db: TableBackend::new(self.store.clone(), REGISTRATION),
                cloud: RegistrationCloud {
                    sim: self.sim.clone(),
                    load_balancers: self.load_balancer_cloud(),
                    instances: self.instance_cloud(),
                },
            }),
        ]
    }
}
