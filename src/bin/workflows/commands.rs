use anyhow::{bail, Context, Result};

use atomic_builder::build::{self, Builder};
use atomic_builder::deployment::status::status_blocks;
use atomic_builder::deployment::usage::usage;
use atomic_builder::deployment::{OstreeStatus, Registry};
use atomic_builder::hash::{builder_hash, Hasher};
use atomic_builder::image::Podman;
use atomic_builder::preflight::{check_required_tools, HOST_TOOLS, IMAGE_TOOLS, UPGRADE_TOOLS};
use atomic_builder::process::System;
use atomic_builder::system::{prepare_nspawn_root, require_root, HostSystem};
use atomic_builder::tree_store::TreeStore;
use atomic_builder::upgrade::{Upgrade, BRANCH};
use atomic_builder::variant::{parse_all_config, variant_names, Layout};
use atomic_builder::Settings;

use super::parse::{Cli, Command};

pub(crate) fn run(cli: Cli) -> Result<()> {
    if cli.command.needs_root() {
        require_root()?;
    }
    let settings = Settings::load(&cli.root, cli.config.as_deref())?;
    tracing::debug!("settings: {settings:?}");

    match cli.command {
        Command::Build {
            push,
            no_cache,
            variants,
        } => cmd_build(&settings, &variants, push, !no_cache),
        Command::Hash { debug, variants } => cmd_hash(&settings, &variants, debug),
        Command::Config { pretty } => cmd_config(&settings, pretty),
        Command::Variants => cmd_variants(&settings),
        Command::Push { tags } => cmd_push(&settings, &tags),
        Command::HashBuilder { no_newline } => cmd_hash_builder(&settings, !no_newline),
        Command::Status => cmd_status(&settings),
        Command::Du => cmd_du(&settings),
        Command::Check => cmd_upgrade(&settings, true),
        Command::Upgrade => cmd_upgrade(&settings, false),
        Command::Prune => cmd_prune(&settings),
        Command::Undeploy { index } => cmd_undeploy(&settings, index),
    }
}

fn cmd_build(settings: &Settings, variants: &[String], push: bool, use_cache: bool) -> Result<()> {
    check_required_tools(IMAGE_TOOLS)?;
    let runner = System;
    let images = Podman::new(&runner);
    let builder = Builder::new(settings, &images);
    for variant in variants {
        builder
            .build(variant, use_cache)
            .with_context(|| format!("building variant '{variant}'"))?;
        if push {
            build::push(settings, &images, variant)?;
        }
    }
    Ok(())
}

fn cmd_hash(settings: &Settings, variants: &[String], debug: bool) -> Result<()> {
    if Layout::new(&settings.root).any_templated(variants) {
        check_required_tools(IMAGE_TOOLS)?;
    }
    let runner = System;
    let images = Podman::new(&runner);
    let hasher = Hasher::new(settings, &images);
    for variant in variants {
        let fingerprint = hasher.hash(variant)?;
        println!("{variant}: {}", fingerprint.short());
        if debug {
            for part in hasher.hash_parts(variant)? {
                println!("  {part}");
            }
        }
    }
    Ok(())
}

fn cmd_config(settings: &Settings, pretty: bool) -> Result<()> {
    let config = parse_all_config(&Layout::new(&settings.root))?;
    let json = if pretty {
        serde_json::to_string_pretty(&config)
    } else {
        serde_json::to_string(&config)
    }
    .context("serializing build config")?;
    println!("{json}");
    Ok(())
}

fn cmd_variants(settings: &Settings) -> Result<()> {
    let config = parse_all_config(&Layout::new(&settings.root))?;
    for name in variant_names(&config)? {
        println!("{name}");
    }
    Ok(())
}

fn cmd_push(settings: &Settings, tags: &[String]) -> Result<()> {
    check_required_tools(IMAGE_TOOLS)?;
    let runner = System;
    let images = Podman::new(&runner);
    for tag in tags {
        build::push(settings, &images, tag).with_context(|| format!("pushing '{tag}'"))?;
    }
    Ok(())
}

fn cmd_hash_builder(settings: &Settings, newline: bool) -> Result<()> {
    let hash = builder_hash(&settings.root, &settings.builder_files)?;
    if newline {
        println!("{hash}");
    } else {
        print!("{hash}");
    }
    Ok(())
}

fn cmd_status(settings: &Settings) -> Result<()> {
    check_required_tools(HOST_TOOLS)?;
    let runner = System;
    let status = OstreeStatus::new(&runner, &settings.sysroot);
    let deployments = Registry::new(&status, &settings.sysroot).list_deployments()?;

    let mut failed = 0;
    for (deployment, block) in deployments
        .iter()
        .zip(status_blocks(&deployments, settings.status_workers)?)
    {
        match block {
            Ok(block) => println!("{block}"),
            Err(err) => {
                failed += 1;
                eprintln!("{}: {err:#}", deployment.index);
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} deployments could not be read", deployments.len());
    }
    Ok(())
}

fn cmd_du(settings: &Settings) -> Result<()> {
    check_required_tools(HOST_TOOLS)?;
    let runner = System;
    let status = OstreeStatus::new(&runner, &settings.sysroot);
    let deployments = Registry::new(&status, &settings.sysroot).list_deployments()?;
    for line in usage(&deployments)?.lines() {
        println!("{line}");
    }
    Ok(())
}

fn cmd_upgrade(settings: &Settings, dry_run: bool) -> Result<()> {
    check_required_tools(UPGRADE_TOOLS)?;
    if !dry_run && !settings.sysroot.join("ostree").is_dir() {
        bail!(
            "tree store missing: '{}' is not an ostree system",
            settings.sysroot.display()
        );
    }

    let runner = System;
    let images = Podman::new(&runner);
    let status = OstreeStatus::new(&runner, &settings.sysroot);
    let registry = Registry::new(&status, &settings.sysroot);
    let mut store = TreeStore::new(settings, &runner);
    let pivot_root = prepare_nspawn_root(settings, &mut store)?;
    let host = HostSystem::new(settings, &runner, &status, pivot_root);

    let mut upgrade = Upgrade::new(settings, &runner, &images, &host, &store, &registry);
    if dry_run {
        for line in upgrade.dry_run()? {
            println!("{line}");
        }
    } else {
        upgrade.run()?;
    }
    Ok(())
}

fn cmd_prune(settings: &Settings) -> Result<()> {
    check_required_tools(UPGRADE_TOOLS)?;
    let runner = System;
    let images = Podman::new(&runner);
    TreeStore::new(settings, &runner).prune(BRANCH, &images)
}

fn cmd_undeploy(settings: &Settings, index: isize) -> Result<()> {
    check_required_tools(HOST_TOOLS)?;
    let runner = System;
    let status = OstreeStatus::new(&runner, &settings.sysroot);
    let deployment = Registry::new(&status, &settings.sysroot).deployment(index)?;
    TreeStore::new(settings, &runner).undeploy(deployment.index)?;
    println!("Removed deployment {}", deployment.index);
    Ok(())
}
