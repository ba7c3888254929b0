use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

use crate::error::BotResult;

fn default_true() -> bool {
    true
}

fn default_subscription_path() -> String {
    "subscriptions.yml".to_string()
}

/// 指令覆写：按规范名重映射显示名/帮助/别名，注册时生效
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CommandOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,

    /// 提供时整体替换原别名列表
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // 群/频道内是否要求 @ 机器人才响应指令 (私聊不受限)
    #[serde(default = "default_true")]
    pub command_needs_focus: bool,

    // 订阅配置文件路径
    #[serde(default = "default_subscription_path")]
    pub subscription_path: String,

    // 指令覆写表，键为指令规范名
    #[serde(default)]
    pub command_overrides: HashMap<String, CommandOverride>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            command_needs_focus: true,
            subscription_path: default_subscription_path(),
            command_overrides: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// 读取配置；文件不存在时写出默认配置并返回之
    pub async fn load_or_create(path: &str) -> BotResult<Self> {
        if Path::new(path).exists() {
            let text = fs::read_to_string(path).await?;
            Ok(toml::from_str(&text)?)
        } else {
            let config = Self::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save(&self, path: &str) -> BotResult<()> {
        let text = toml::to_string_pretty(self)?;
        fs::write(path, text).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_or_create_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let path_str = path.to_str().unwrap();

        let created = AppConfig::load_or_create(path_str).await.unwrap();
        assert!(created.command_needs_focus);
        assert!(path.exists());

        let loaded = AppConfig::load_or_create(path_str).await.unwrap();
        assert_eq!(loaded.subscription_path, created.subscription_path);
    }

    #[tokio::test]
    async fn overrides_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let path_str = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.command_overrides.insert(
            "echo".to_string(),
            CommandOverride {
                name: Some("复读".to_string()),
                help: None,
                alias: Some(vec!["r".to_string()]),
            },
        );
        config.save(path_str).await.unwrap();

        let loaded = AppConfig::load_or_create(path_str).await.unwrap();
        let over = &loaded.command_overrides["echo"];
        assert_eq!(over.name.as_deref(), Some("复读"));
        assert_eq!(over.alias.as_deref(), Some(&["r".to_string()][..]));
    }
}
