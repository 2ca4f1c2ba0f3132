//! `pluffy init`, `pluffy submit` and `pluffy show`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pluffy::config::StudioConfig;
use pluffy::explorer::breadcrumb;
use pluffy::explorer::presenter::{ResultPresenter, ViewSnapshot};
use pluffy::explorer::tree::render_text;
use pluffy::studio::db::DbHandle;
use pluffy::studio::models::JobStatus;
use pluffy::studio::producer::Producer;
use pluffy::studio::server::{build_worker, open_db};

use super::super::Overrides;

pub fn cmd_init(config_path: &Path, db_path: Option<PathBuf>) -> Result<()> {
    if config_path.exists() {
        println!("Config already exists at {}", config_path.display());
    } else {
        let mut config = StudioConfig::default();
        if let Some(db_path) = &db_path {
            config.server.db_path = db_path.clone();
        }
        config.save(config_path)?;
        println!("Wrote default config to {}", config_path.display());
    }

    let config = super::load_config(
        config_path,
        Overrides {
            db_path,
            ..Overrides::default()
        },
    )?;
    open_db(&config.server.db_path)?;
    println!("Studio database initialized at {}", config.server.db_path.display());
    Ok(())
}

pub async fn cmd_submit(
    config_path: &Path,
    overrides: Overrides,
    value: &str,
    wait: bool,
) -> Result<()> {
    let config = super::load_config(config_path, overrides)?;
    let db = open_db(&config.server.db_path)?;

    let submission = Producer::new(db.clone()).submit(value).await?;
    println!(
        "Created project {} ({})",
        submission.project.name, submission.project.id
    );

    if wait {
        let worker = build_worker(db.clone(), None, &config);
        let report = worker.run_job(&submission.job.id).await?;
        tracing::debug!(?report, "submitted job finished");
        print_project(&db, &submission.project.id).await?;
    }
    Ok(())
}

pub async fn cmd_show(config_path: &Path, overrides: Overrides, id: &str) -> Result<()> {
    let config = super::load_config(config_path, overrides)?;
    let db = open_db(&config.server.db_path)?;
    print_project(&db, id).await
}

async fn print_project(db: &DbHandle, id: &str) -> Result<()> {
    let id_owned = id.to_string();
    let detail = db
        .call(move |db| db.get_project_detail(&id_owned))
        .await?
        .with_context(|| format!("Project not found: {}", id))?;

    println!();
    println!("{} ({})", detail.project.name, detail.project.id);
    println!("Updated: {}", detail.project.updated_at);
    let project_id = detail.project.id.clone();
    let jobs = db.call(move |db| db.jobs_for_project(&project_id)).await?;
    for job in &jobs {
        match &job.last_error {
            Some(error) if job.status != JobStatus::Completed => println!(
                "Job {}: {} after {} attempt(s) ({})",
                job.id, job.status, job.attempts, error
            ),
            _ => println!("Job {}: {} after {} attempt(s)", job.id, job.status, job.attempts),
        }
    }
    println!();
    for message in &detail.messages {
        println!("[{} {}] {}", message.role, message.message_type, message.content);
    }

    let mut presenter = ResultPresenter::new();
    presenter.update(&detail.messages);
    println!();
    match presenter.snapshot() {
        ViewSnapshot::Loading { text } => println!("{}", text),
        ViewSnapshot::Failed { message } => println!("Failed: {}", message),
        ViewSnapshot::Answered { content } => println!("{}", content),
        ViewSnapshot::Ready {
            title,
            sandbox_url,
            explorer,
            ..
        } => {
            println!("Fragment: {}", title);
            match sandbox_url {
                Some(url) => println!("Preview: {}", url),
                None => println!("Preview: (none)"),
            }
            println!();
            print!("{}", render_text(&explorer.tree));
            if explorer.selected.is_some() {
                println!();
                println!("{}", breadcrumb::render_text(&explorer.breadcrumb));
            }
        }
    }
    Ok(())
}
