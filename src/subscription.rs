//! 订阅索引：目标 → 插件作用域的层级映射
//!
//! 目标分三层继承：具体目标 (用户/群/频道) → 机器人级 → 全局。
//! 查询结果按目标键做记忆化缓存，任何变更都会按继承关系失效缓存，
//! 并全量重写持久化文件 (批量装载时可抑制)。

use crate::error::{BotError, BotResult};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;
use tokio::fs;
use tokio::sync::Mutex as AsyncMutex;

fn default_scope() -> String {
    "*".to_string()
}

fn is_default_scope(scope: &String) -> bool {
    scope == "*"
}

fn default_true() -> bool {
    true
}

fn is_true(b: &bool) -> bool {
    *b
}

/// 订阅项：某插件 (的某作用域) 对某目标启用
///
/// 写盘时默认值字段会被归一化省略 (`scope = "*"`、`enabled = true`、
/// 空 `params`/`allowed_roles`)，读回后仍等价。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscribeItem {
    /// 插件 ID
    pub id: String,

    /// 作用域，`*` 表示插件的全部作用域
    #[serde(default = "default_scope", skip_serializing_if = "is_default_scope")]
    pub scope: String,

    #[serde(default = "default_true", skip_serializing_if = "is_true")]
    pub enabled: bool,

    /// 目标级参数，插件自行解释
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, serde_json::Value>,

    /// 非空时仅对这些会话角色生效
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_roles: Vec<String>,
}

impl SubscribeItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            scope: default_scope(),
            enabled: true,
            params: Map::new(),
            allowed_roles: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// 目标内唯一键，重复添加按此键原地覆盖
    pub fn key(&self) -> String {
        format!("{}:{}", self.id, self.scope)
    }
}

/// 订阅目标
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscribeTarget {
    Global,
    /// 机器人级兜底
    Robot { robot: String },
    /// 该机器人的全部私聊
    RobotUser { robot: String },
    Channel {
        robot: String,
        channel: String,
    },
    Group {
        robot: String,
        group: String,
        root_group: Option<String>,
    },
}

impl SubscribeTarget {
    pub fn robot(robot: impl Into<String>) -> Self {
        Self::Robot {
            robot: robot.into(),
        }
    }

    pub fn group(robot: impl Into<String>, group: impl Into<String>) -> Self {
        Self::Group {
            robot: robot.into(),
            group: group.into(),
            root_group: None,
        }
    }

    /// 目标键，构造规则固定且可复现
    pub fn key(&self) -> String {
        match self {
            SubscribeTarget::Global => "global".to_string(),
            SubscribeTarget::Robot { robot } => format!("robot:{robot}"),
            SubscribeTarget::RobotUser { robot } => format!("robot:{robot}:user"),
            SubscribeTarget::Channel { robot, channel } => {
                format!("robot:{robot}:channel:{channel}")
            }
            SubscribeTarget::Group {
                robot,
                group,
                root_group,
            } => match root_group {
                Some(root) => format!("robot:{robot}:group:{root}/{group}"),
                None => format!("robot:{robot}:group:{group}"),
            },
        }
    }

    pub fn robot_id(&self) -> Option<&str> {
        match self {
            SubscribeTarget::Global => None,
            SubscribeTarget::Robot { robot }
            | SubscribeTarget::RobotUser { robot }
            | SubscribeTarget::Channel { robot, .. }
            | SubscribeTarget::Group { robot, .. } => Some(robot),
        }
    }

    /// 查询时的继承链：具体目标 → 机器人级 → 全局
    fn chain(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(3);
        keys.push(self.key());
        if let Some(robot) = self.robot_id() {
            let robot_key = format!("robot:{robot}");
            if robot_key != keys[0] {
                keys.push(robot_key);
            }
        }
        if keys[0] != "global" {
            keys.push("global".to_string());
        }
        keys
    }

    /// 机器人级/全局变更会影响所有后代目标，需整体失效缓存
    fn invalidates_all(&self) -> bool {
        matches!(self, SubscribeTarget::Global | SubscribeTarget::Robot { .. })
    }

    /// 传入非法目标属于调用方编程错误，快速失败
    fn validate(&self) -> BotResult<()> {
        let bad = |what: &str| Err(BotError::InvalidTarget(format!("{what} 不能为空")));
        match self {
            SubscribeTarget::Global => Ok(()),
            SubscribeTarget::Robot { robot } | SubscribeTarget::RobotUser { robot } => {
                if robot.is_empty() {
                    return bad("robot id");
                }
                Ok(())
            }
            SubscribeTarget::Channel { robot, channel } => {
                if robot.is_empty() {
                    return bad("robot id");
                }
                if channel.is_empty() {
                    return bad("channel id");
                }
                Ok(())
            }
            SubscribeTarget::Group { robot, group, .. } => {
                if robot.is_empty() {
                    return bad("robot id");
                }
                if group.is_empty() {
                    return bad("group id");
                }
                Ok(())
            }
        }
    }
}

// ================== 持久化文件模型 ==================

#[derive(Debug, Serialize, Deserialize, Default)]
struct GlobalSection {
    plugins: Vec<SubscribeItem>,
}

/// 机器人下的单个目标配置；选择器均缺省时为机器人级兜底
#[derive(Debug, Serialize, Deserialize, Clone)]
struct TargetSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    #[serde(default, rename = "rootGroup", skip_serializing_if = "Option::is_none")]
    root_group: Option<String>,
    // 故意不加 default：缺少 plugins 数组视为该机器人配置损坏
    plugins: Vec<SubscribeItem>,
}

impl TargetSection {
    fn target(&self, robot: &str) -> SubscribeTarget {
        if self.user == Some(true) {
            SubscribeTarget::RobotUser {
                robot: robot.to_string(),
            }
        } else if let Some(channel) = &self.channel {
            SubscribeTarget::Channel {
                robot: robot.to_string(),
                channel: channel.clone(),
            }
        } else if let Some(group) = &self.group {
            SubscribeTarget::Group {
                robot: robot.to_string(),
                group: group.clone(),
                root_group: self.root_group.clone(),
            }
        } else {
            SubscribeTarget::Robot {
                robot: robot.to_string(),
            }
        }
    }

    fn for_target(target: &SubscribeTarget, plugins: Vec<SubscribeItem>) -> Self {
        let mut section = Self {
            user: None,
            channel: None,
            group: None,
            root_group: None,
            plugins,
        };
        match target {
            SubscribeTarget::RobotUser { .. } => section.user = Some(true),
            SubscribeTarget::Channel { channel, .. } => section.channel = Some(channel.clone()),
            SubscribeTarget::Group {
                group, root_group, ..
            } => {
                section.group = Some(group.clone());
                section.root_group = root_group.clone();
            }
            SubscribeTarget::Robot { .. } | SubscribeTarget::Global => {}
        }
        section
    }
}

#[derive(Debug, Serialize, Default)]
struct FileModel {
    #[serde(skip_serializing_if = "Option::is_none")]
    global: Option<GlobalSection>,
    #[serde(flatten)]
    robots: BTreeMap<String, Vec<TargetSection>>,
}

// ================== 索引本体 ==================

struct TargetEntry {
    target: SubscribeTarget,
    items: Vec<SubscribeItem>,
}

#[derive(Default)]
struct IndexState {
    /// 目标键 → 订阅项列表 (保持插入顺序)
    targets: HashMap<String, TargetEntry>,
    /// 订阅项键 → 目标键列表，用于反向查询
    item_to_targets: HashMap<String, Vec<String>>,
    /// 目标键 → 合并结果 (含 disabled 项) 的记忆化缓存
    resolved_cache: HashMap<String, Vec<SubscribeItem>>,
}

/// 订阅索引
///
/// 内存变更全部在同步锁临界区内完成 (无 await)，文件写入在快照后
/// 由单写者异步锁串行化，对应老实现里“自写抑制标志”的职责。
pub struct SubscriptionIndex {
    state: RwLock<IndexState>,
    path: Option<PathBuf>,
    save_lock: AsyncMutex<()>,
}

impl Default for SubscriptionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionIndex {
    /// 纯内存索引 (测试或不需要持久化的场景)
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            path: None,
            save_lock: AsyncMutex::new(()),
        }
    }

    /// 带持久化文件的索引，`load()` 后可用
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            path: Some(path.into()),
            save_lock: AsyncMutex::new(()),
        }
    }

    /// 从持久化文件重建索引
    ///
    /// 单个机器人段落损坏 (解析失败、缺 plugins 数组) 只影响该机器人，
    /// 记录日志后继续装载其余内容。
    pub async fn load(&self) -> BotResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let text = fs::read_to_string(path).await?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&text)?;
        let serde_yaml::Value::Mapping(mapping) = doc else {
            return Err(BotError::Subscription(
                "订阅文件根节点必须是映射".to_string(),
            ));
        };

        let mut fresh = IndexState::default();

        for (key, value) in mapping {
            let Some(name) = key.as_str() else {
                continue;
            };
            if name == "global" {
                match serde_yaml::from_value::<GlobalSection>(value) {
                    Ok(section) => {
                        for item in section.plugins {
                            Self::upsert_locked(&mut fresh, &SubscribeTarget::Global, item);
                        }
                    }
                    Err(e) => {
                        error!(target: "Subscription", "全局订阅段落损坏，已跳过: {}", e);
                    }
                }
                continue;
            }

            match serde_yaml::from_value::<Vec<TargetSection>>(value) {
                Ok(sections) => {
                    for section in sections {
                        let target = section.target(name);
                        for item in section.plugins {
                            Self::upsert_locked(&mut fresh, &target, item);
                        }
                    }
                }
                Err(e) => {
                    error!(target: "Subscription", "机器人 [{}] 订阅段落损坏，已跳过: {}", name, e);
                }
            }
        }

        *self.state.write().unwrap() = fresh;
        Ok(())
    }

    /// 查询目标可见的订阅项
    ///
    /// 合并顺序：具体目标 → 机器人级 → 全局；同键首次出现者胜出
    /// (具体目标遮蔽上层)。结果按目标键缓存。
    pub fn get_subscribe_items(
        &self,
        target: &SubscribeTarget,
        include_disabled: bool,
    ) -> Vec<SubscribeItem> {
        let key = target.key();

        {
            let state = self.state.read().unwrap();
            if let Some(cached) = state.resolved_cache.get(&key) {
                return Self::filter_enabled(cached, include_disabled);
            }
        }

        let mut state = self.state.write().unwrap();
        // 双检：拿写锁前可能已有并发查询填充了缓存
        if !state.resolved_cache.contains_key(&key) {
            let mut merged = Vec::new();
            let mut seen = HashSet::new();
            for level in target.chain() {
                if let Some(entry) = state.targets.get(&level) {
                    for item in &entry.items {
                        if seen.insert(item.key()) {
                            merged.push(item.clone());
                        }
                    }
                }
            }
            state.resolved_cache.insert(key.clone(), merged);
        }
        Self::filter_enabled(&state.resolved_cache[&key], include_disabled)
    }

    fn filter_enabled(items: &[SubscribeItem], include_disabled: bool) -> Vec<SubscribeItem> {
        items
            .iter()
            .filter(|item| include_disabled || item.enabled)
            .cloned()
            .collect()
    }

    /// 新增或覆盖订阅项 (同键原地覆盖，后写者胜)
    pub async fn add_subscribe(
        &self,
        target: &SubscribeTarget,
        item: SubscribeItem,
        save: bool,
    ) -> BotResult<()> {
        target.validate()?;
        {
            let mut state = self.state.write().unwrap();
            Self::upsert_locked(&mut state, target, item);
            Self::invalidate_locked(&mut state, target);
        }
        if save {
            self.persist().await?;
        }
        Ok(())
    }

    /// `add_subscribe` 的同义操作，语义上用于已存在项的更新
    pub async fn update_subscribe(
        &self,
        target: &SubscribeTarget,
        item: SubscribeItem,
        save: bool,
    ) -> BotResult<()> {
        self.add_subscribe(target, item, save).await
    }

    /// 移除订阅项；`item_key` 为 `插件ID` 或 `插件ID:作用域`
    pub async fn remove_subscribe(
        &self,
        target: &SubscribeTarget,
        item_key: &str,
        save: bool,
    ) -> BotResult<()> {
        target.validate()?;
        let item_key = Self::normalize_item_key(item_key);
        let target_key = target.key();
        {
            let mut state = self.state.write().unwrap();
            if let Some(entry) = state.targets.get_mut(&target_key) {
                entry.items.retain(|item| item.key() != item_key);
                if entry.items.is_empty() {
                    state.targets.remove(&target_key);
                }
            }
            if let Some(targets) = state.item_to_targets.get_mut(&item_key) {
                targets.retain(|key| key != &target_key);
                if targets.is_empty() {
                    state.item_to_targets.remove(&item_key);
                }
            }
            Self::invalidate_locked(&mut state, target);
        }
        if save {
            self.persist().await?;
        }
        Ok(())
    }

    /// 反向查询：订阅了某插件/作用域的全部目标
    pub fn get_subscribed_targets(&self, item_key: &str) -> Vec<SubscribeTarget> {
        let item_key = Self::normalize_item_key(item_key);
        let state = self.state.read().unwrap();
        state
            .item_to_targets
            .get(&item_key)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| state.targets.get(key).map(|e| e.target.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn normalize_item_key(key: &str) -> String {
        if key.contains(':') {
            key.to_string()
        } else {
            format!("{key}:*")
        }
    }

    fn upsert_locked(state: &mut IndexState, target: &SubscribeTarget, item: SubscribeItem) {
        let target_key = target.key();
        let item_key = item.key();

        let entry = state
            .targets
            .entry(target_key.clone())
            .or_insert_with(|| TargetEntry {
                target: target.clone(),
                items: Vec::new(),
            });
        match entry.items.iter_mut().find(|i| i.key() == item_key) {
            Some(existing) => *existing = item,
            None => entry.items.push(item),
        }

        let targets = state.item_to_targets.entry(item_key).or_default();
        if !targets.contains(&target_key) {
            targets.push(target_key);
        }
    }

    fn invalidate_locked(state: &mut IndexState, target: &SubscribeTarget) {
        if target.invalidates_all() {
            state.resolved_cache.clear();
        } else {
            state.resolved_cache.remove(&target.key());
        }
    }

    /// 全量重写持久化文件；写入由单写者锁串行化
    pub async fn persist(&self) -> BotResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let text = {
            let state = self.state.read().unwrap();
            let mut model = FileModel::default();
            let mut sections: BTreeMap<String, Vec<(String, TargetSection)>> = BTreeMap::new();

            for entry in state.targets.values() {
                if entry.items.is_empty() {
                    continue;
                }
                match &entry.target {
                    SubscribeTarget::Global => {
                        model.global = Some(GlobalSection {
                            plugins: entry.items.clone(),
                        });
                    }
                    other => {
                        let robot = other.robot_id().unwrap_or_default().to_string();
                        sections.entry(robot).or_default().push((
                            other.key(),
                            TargetSection::for_target(other, entry.items.clone()),
                        ));
                    }
                }
            }

            for (robot, mut list) in sections {
                // 目标键排序，保证输出稳定
                list.sort_by(|a, b| a.0.cmp(&b.0));
                model
                    .robots
                    .insert(robot, list.into_iter().map(|(_, s)| s).collect());
            }

            serde_yaml::to_string(&model)?
        };

        let _guard = self.save_lock.lock().await;
        fs::write(path, text).await?;
        Ok(())
    }
}
