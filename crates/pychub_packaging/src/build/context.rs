use super::plan::BuildPlan;
use crate::resolver::{
    FilesystemWheelStrategy, HttpWheelStrategy, MetadataResolver, Pep658SidecarMetadataStrategy,
    Pep691SimpleApiMetadataStrategy, ResolverConfig, WheelInspectionMetadataStrategy,
    WheelResolver,
};
use std::path::PathBuf;
use std::sync::Arc;

/// The per-invocation packaging context: the three artifact resolvers wired together over a
/// shared HTTP client. The orchestrator creates one at PLAN entry and drops it when the
/// invocation ends, so resolver state never leaks across invocations.
pub struct PackagingContext {
    /// Resolves wheel bytes to disk.
    pub wheel_resolver: Arc<WheelResolver>,

    /// Resolves project-wide PEP 691 candidate metadata.
    pub candidate_resolver: Arc<MetadataResolver>,

    /// Resolves per-(wheel, context) dependency metadata.
    pub dependency_resolver: Arc<MetadataResolver>,
}

impl PackagingContext {
    /// Wires up the resolvers for the plan's staging directory. The wheel resolver gets the
    /// filesystem and HTTP strategies, the candidate resolver the PEP 691 strategy, and the
    /// dependency resolver the PEP 658 sidecar strategy with wheel inspection as last resort.
    pub fn init(
        plan: &BuildPlan,
        index_base_url: Option<&str>,
        client: reqwest::Client,
    ) -> std::io::Result<Self> {
        let local_root = plan.project_staging_dir();
        let global_root: PathBuf = plan.cache_root.join("global");
        fs_err::create_dir_all(&global_root)?;

        let wheel_resolver = Arc::new(WheelResolver::new(
            ResolverConfig::for_wheels(local_root.clone(), global_root.clone()),
            vec![
                Box::new(FilesystemWheelStrategy::default()),
                Box::new(HttpWheelStrategy::new(client.clone())),
            ],
        )?);

        let pep691 = match index_base_url {
            Some(base) => Pep691SimpleApiMetadataStrategy::with_base_url(client.clone(), base),
            None => Pep691SimpleApiMetadataStrategy::new(client.clone()),
        };
        let candidate_resolver = Arc::new(MetadataResolver::candidate(
            ResolverConfig::for_metadata(local_root.clone(), global_root.clone()),
            vec![Box::new(pep691)],
        )?);

        let dependency_resolver = Arc::new(MetadataResolver::dependency(
            ResolverConfig::for_metadata(local_root, global_root),
            vec![
                Box::new(Pep658SidecarMetadataStrategy::new(
                    client,
                    candidate_resolver.clone(),
                )),
                Box::new(WheelInspectionMetadataStrategy::new(
                    wheel_resolver.clone(),
                    candidate_resolver.clone(),
                )),
            ],
        )?);

        Ok(Self {
            wheel_resolver,
            candidate_resolver,
            dependency_resolver,
        })
    }

    /// Persists every resolver index.
    pub fn flush(&self) -> std::io::Result<()> {
        self.wheel_resolver.flush()?;
        self.candidate_resolver.flush()?;
        self.dependency_resolver.flush()?;
        Ok(())
    }
}
