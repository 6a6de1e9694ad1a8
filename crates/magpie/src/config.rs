use anyhow::{Context, Result};
use magpie_core::MagpieError;
use magpie_core::config::{BackgroundConfig, ServerConfig, TaskSpec};
use std::path::Path;
use tokio::fs;

pub async fn load_server_config(path: &Path) -> Result<ServerConfig> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

    let config: ServerConfig =
        toml::from_str(&contents).context("Failed to parse configuration file")?;

    Ok(config)
}

pub async fn save_server_config(path: &Path, config: &ServerConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let contents = toml::to_string_pretty(config).context("Failed to serialize configuration")?;

    fs::write(path, contents)
        .await
        .context("Failed to write configuration file")?;

    Ok(())
}

pub async fn load_background_config(path: &Path) -> Result<BackgroundConfig> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read background config {}", path.display()))?;

    // Check task kinds up front so an unknown kind reports as exactly that
    // instead of a generic enum parse failure.
    let raw: toml::Value =
        toml::from_str(&contents).context("Failed to parse background config")?;
    if let Some(tasks) = raw.get("tasks").and_then(|value| value.as_array()) {
        for task in tasks {
            match task.get("task_name").and_then(|value| value.as_str()) {
                Some(kind) if TaskSpec::KINDS.contains(&kind) => {}
                Some(kind) => return Err(MagpieError::UnknownTaskKind(kind.to_string()).into()),
                None => {
                    return Err(MagpieError::InvalidConfig(
                        "task entry without a task_name".to_string(),
                    )
                    .into());
                }
            }
        }
    }

    let config: BackgroundConfig =
        toml::from_str(&contents).context("Failed to parse background config")?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_task_kind_is_its_own_error() {
        let dir = tempdir();
        let path = dir.join("bg.toml");
        fs::write(
            &path,
            r#"
            [[tasks]]
            task_name = "polish_lenses"
            every = "00:10:00"
            soft_timeout = "00:05:00"
            "#,
        )
        .await
        .unwrap();

        let err = load_background_config(&path).await.unwrap_err();
        let magpie = err.downcast_ref::<MagpieError>().unwrap();
        assert!(matches!(magpie, MagpieError::UnknownTaskKind(kind) if kind == "polish_lenses"));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn server_config_round_trips_through_disk() {
        let dir = tempdir();
        let path = dir.join("config.toml");
        let config = ServerConfig::default();

        save_server_config(&path, &config).await.unwrap();
        let back = load_server_config(&path).await.unwrap();
        assert_eq!(back.name, config.name);
        assert_eq!(back.stores.len(), config.stores.len());
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "magpie-config-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
