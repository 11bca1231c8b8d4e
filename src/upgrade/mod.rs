//! Local system upgrade.
//!
//! An upgrade rebuilds the Systemfile into [`SYSTEM_IMAGE`], streams the
//! container filesystem through [`normalizing_feed`] into the tree store,
//! prunes, deploys the new commit and regenerates the bootloader config.
//! [`Upgrade`] walks these steps as an explicit state machine so a failure
//! can be attributed to the step it happened in.
//!
//! - [`check`] - What an upgrade would change, without changing anything

pub mod check;

use anyhow::{Context, Result};
use std::fmt;

use crate::build::{BuildArgs, Builder, SYSTEM_IMAGE};
use crate::deployment::Registry;
use crate::image::{single_base_image, ImageBackend};
use crate::process::{Cmd, Runner};
use crate::settings::Settings;
use crate::system::SystemProbe;
use crate::tree_store::export::normalizing_feed;
use crate::tree_store::TreeStore;

pub use check::{changes, context_hash};

/// Tree-store branch holding the local system.
pub const BRANCH: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeState {
    Idle,
    Checking,
    Building,
    Exporting,
    Committing,
    Pruning,
    Deploying,
    BootloaderUpdate,
    Done,
    Failed,
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpgradeState::Idle => "idle",
            UpgradeState::Checking => "checking",
            UpgradeState::Building => "building",
            UpgradeState::Exporting => "exporting",
            UpgradeState::Committing => "committing",
            UpgradeState::Pruning => "pruning",
            UpgradeState::Deploying => "deploying",
            UpgradeState::BootloaderUpdate => "updating bootloader",
            UpgradeState::Done => "done",
            UpgradeState::Failed => "failed",
        };
        f.write_str(name)
    }
}

pub struct Upgrade<'a> {
    settings: &'a Settings,
    runner: &'a dyn Runner,
    images: &'a dyn ImageBackend,
    probe: &'a dyn SystemProbe,
    store: &'a TreeStore<'a>,
    registry: &'a Registry<'a>,
    trail: Vec<UpgradeState>,
}

impl<'a> Upgrade<'a> {
    pub fn new(
        settings: &'a Settings,
        runner: &'a dyn Runner,
        images: &'a dyn ImageBackend,
        probe: &'a dyn SystemProbe,
        store: &'a TreeStore<'a>,
        registry: &'a Registry<'a>,
    ) -> Self {
        Self {
            settings,
            runner,
            images,
            probe,
            store,
            registry,
            trail: vec![UpgradeState::Idle],
        }
    }

    pub fn state(&self) -> UpgradeState {
        self.trail.last().copied().unwrap_or(UpgradeState::Idle)
    }

    /// Every state entered so far, oldest first.
    pub fn trail(&self) -> &[UpgradeState] {
        &self.trail
    }

    fn enter(&mut self, state: UpgradeState) {
        tracing::info!("upgrade: {state}");
        self.trail.push(state);
    }

    /// Run one step in `state`; on error the machine ends in `Failed`.
    fn step<T>(
        &mut self,
        state: UpgradeState,
        f: impl FnOnce(&Self) -> Result<T>,
    ) -> Result<T> {
        self.enter(state);
        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.enter(UpgradeState::Failed);
                Err(err.context(format!("upgrade failed while {state}")))
            }
        }
    }

    fn changes(&self) -> Result<Vec<String>> {
        let image = single_base_image(&self.settings.systemfile, &BuildArgs::new())?;
        changes(&image, self.probe, self.images)
    }

    /// Compute the change list without building anything.
    pub fn dry_run(&mut self) -> Result<Vec<String>> {
        self.step(UpgradeState::Checking, Self::changes)
    }

    /// Perform the upgrade. Returns the change list computed up front.
    pub fn run(&mut self) -> Result<Vec<String>> {
        let changes = self.step(UpgradeState::Checking, Self::changes)?;
        for line in &changes {
            tracing::info!("{line}");
        }

        let context = self.step(UpgradeState::Building, |up| {
            let kargs = up.probe.kernel_commandline()?;
            let context = context_hash(&up.probe.systemfile()?, &kargs);
            let mut args = BuildArgs::new();
            args.insert("KARGS", &kargs);
            args.insert("CONTEXT_HASH", &context);
            Builder::new(up.settings, up.images).build_system(&up.settings.systemfile, args)?;
            Ok(context)
        })?;

        let (container, export) = self.step(UpgradeState::Exporting, |up| {
            let container = up.images.create_container(SYSTEM_IMAGE)?;
            match up.images.export_container(&container) {
                Ok(export) => Ok((container, export)),
                Err(err) => {
                    if let Err(cleanup) = up.images.remove_container(&container) {
                        tracing::warn!("removing container {container}: {cleanup:#}");
                    }
                    Err(err)
                }
            }
        })?;

        self.step(UpgradeState::Committing, |up| {
            let mtime = u64::try_from(up.settings.source_timestamp).unwrap_or(0);
            let committed = up.store.commit_stream(BRANCH, normalizing_feed(export, mtime));
            let removed = up.images.remove_container(&container);
            committed?;
            removed
        })?;

        self.step(UpgradeState::Pruning, |up| up.store.prune(BRANCH, up.images))?;

        self.step(UpgradeState::Deploying, |up| {
            up.store.deploy(BRANCH, &up.settings.sysroot, up.registry)
        })?;

        self.step(UpgradeState::BootloaderUpdate, |up| {
            let config = &up.settings.grub_config;
            up.runner
                .run(Cmd::new("grub-mkconfig").arg("-o").arg(config.display().to_string()))
                .with_context(|| format!("writing bootloader config '{}'", config.display()))
        })?;

        self.probe.record_context_hash(&context)?;
        self.enter(UpgradeState::Done);
        Ok(changes)
    }
}
