use std::io::Write;
use std::path::Path;

use werf_build::{ConveyorError, StageCoordinator, compute_chain, plan_stages};
use werf_core::{StageRecord, StageSignature, WerfConfig};
use werf_storage::names;
use werf_sync::Synchronization;

struct Project {
    name: String,
    sync: Synchronization,
}

impl Project {
    fn open(dir: &Path, synchronization: Option<&str>) -> anyhow::Result<Self> {
        let config = WerfConfig::load(dir)?;
        let sync = Synchronization::from_config(&config, synchronization)?;
        let name = config.project_name()?.to_owned();
        tracing::debug!(
            project = %name,
            address = ?sync.address(),
            client_id = %sync.client_id(),
            "project opened",
        );
        Ok(Self { name, sync })
    }

    fn coordinator(&self) -> StageCoordinator {
        StageCoordinator::new(self.sync.locks().clone(), self.sync.cache())
    }
}

/// Print `<stage> <signature>` for every stage, in build order.
pub fn stages_signatures(dir: &Path, base_image_digest: &str) -> anyhow::Result<()> {
    let config = WerfConfig::load(dir)?;
    let stages = plan_stages(&config, dir)?;
    if stages.is_empty() {
        eprintln!("No [[stage]] entries in werf.toml");
        return Ok(());
    }

    for (name, signature) in compute_chain(base_image_digest, &stages) {
        println!("{name} {signature}");
    }
    Ok(())
}

pub async fn stages_lookup(
    dir: &Path,
    synchronization: Option<&str>,
    signature: &str,
) -> anyhow::Result<()> {
    let project = Project::open(dir, synchronization)?;
    let signature = StageSignature::from(signature);

    match project
        .coordinator()
        .lookup_cached_stage(&project.name, &signature)
        .await?
    {
        Some(record) => println!("{} {}", record.image_id, record.tag()),
        None => println!("No stage cached for {signature}"),
    }
    Ok(())
}

pub async fn stages_publish(
    dir: &Path,
    synchronization: Option<&str>,
    signature: &str,
    image_id: &str,
) -> anyhow::Result<()> {
    let project = Project::open(dir, synchronization)?;
    let signature = StageSignature::from(signature);
    let record = StageRecord::new(image_id, signature.clone());

    let outcome = project
        .coordinator()
        .publish_stage(&project.name, &signature, &record)
        .await?;
    if outcome.accepted {
        println!("Published {image_id} as {}", outcome.canonical.tag());
    } else {
        println!(
            "Kept earlier image {} for {signature}; discard {image_id}",
            outcome.canonical.image_id
        );
    }
    Ok(())
}

pub async fn stages_list(
    dir: &Path,
    synchronization: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let project = Project::open(dir, synchronization)?;
    let mut stages = project.sync.cache().get_all_stages(&project.name).await?;
    stages.sort_by(|a, b| {
        a.signature
            .as_str()
            .cmp(b.signature.as_str())
            .then_with(|| a.canonical_cmp(b))
    });

    if json {
        println!("{}", serde_json::to_string_pretty(&stages)?);
        return Ok(());
    }
    if stages.is_empty() {
        println!("No stages cached for project '{}'", project.name);
        return Ok(());
    }
    for record in &stages {
        println!(
            "{} {} {}",
            record.signature,
            record.image_id,
            record.created_at.to_rfc3339()
        );
    }
    Ok(())
}

/// Delete every cached stage while holding the project exclusively.
pub async fn stages_purge(
    dir: &Path,
    synchronization: Option<&str>,
    skip_confirm: bool,
) -> anyhow::Result<()> {
    let project = Project::open(dir, synchronization)?;

    if !skip_confirm {
        print!(
            "This will forget every cached stage of '{}'. Are you sure? [y/N] ",
            project.name
        );
        std::io::stdout().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if !matches!(input.trim(), "y" | "Y" | "yes" | "YES") {
            println!("Aborted.");
            return Ok(());
        }
    }

    let locks = project.sync.locks();
    let cache = project.sync.cache();
    let lock_name = names::stages_and_images_lock_name(&project.name);
    let purged = locks
        .with_lock(&lock_name, &locks.defaults().no_wait(), || async {
            let count = cache.get_all_stages(&project.name).await?.len();
            cache.delete_all_stages(&project.name).await?;
            Ok::<_, ConveyorError>(count)
        })
        .await?;

    println!("Purged {purged} stage(s) of '{}'", project.name);
    Ok(())
}
