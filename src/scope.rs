//! 插件作用域：每个 (插件, 作用域) 一个注册门面
//!
//! 注册同时写入本地副本 (供帮助文本等枚举用途) 并转发给 EventBus。
//! 一个插件可以暴露多个作用域，各自独立订阅、独立销毁。

use crate::bus::{CommandInfo, EventBus};
use crate::event::{DEFAULT_PRIORITY, EventContext, EventName, EventPayload, Listener, Resolver};
use crate::identity::{ChatIdentity, ChatType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// 插件默认作用域名
pub const DEFAULT_SCOPE: &str = "main";

fn default_true() -> bool {
    true
}

fn default_robot_types() -> Vec<String> {
    vec!["*".to_string()]
}

/// 作用域策略：决定该作用域能出现在哪些会话里
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopePolicy {
    #[serde(default = "default_true")]
    pub allow_private: bool,
    #[serde(default = "default_true")]
    pub allow_group: bool,
    #[serde(default = "default_true")]
    pub allow_channel: bool,

    /// 允许的机器人类型；`["*"]` 或空列表表示不限
    #[serde(default = "default_robot_types")]
    pub allowed_robot_types: Vec<String>,

    /// 未显式订阅时默认参与分发
    #[serde(default)]
    pub auto_subscribe: bool,

    /// 无视订阅配置，始终参与分发 (系统级作用域使用)
    #[serde(default)]
    pub force_subscribe: bool,
}

impl Default for ScopePolicy {
    fn default() -> Self {
        Self {
            allow_private: true,
            allow_group: true,
            allow_channel: true,
            allowed_robot_types: default_robot_types(),
            auto_subscribe: false,
            force_subscribe: false,
        }
    }
}

impl ScopePolicy {
    pub fn auto() -> Self {
        Self {
            auto_subscribe: true,
            ..Default::default()
        }
    }

    pub fn allows_chat(&self, chat_type: ChatType) -> bool {
        match chat_type {
            ChatType::Private => self.allow_private,
            ChatType::Group => self.allow_group,
            ChatType::Channel => self.allow_channel,
            ChatType::Raw => true,
        }
    }

    pub fn allows_robot(&self, robot_type: &str) -> bool {
        self.allowed_robot_types.is_empty()
            || self
                .allowed_robot_types
                .iter()
                .any(|t| t == "*" || t == robot_type)
    }

    /// 策略是否兼容该发送者 (会话类型 + 机器人类型)
    pub fn allows(&self, sender: &ChatIdentity) -> bool {
        self.allows_chat(sender.chat_type) && self.allows_robot(&sender.robot_type)
    }
}

/// 作用域身份：(插件 ID, 作用域名)，全局唯一
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeId {
    pub plugin: String,
    pub scope: String,
}

impl ScopeId {
    pub fn new(plugin: impl Into<String>, scope: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            scope: scope.into(),
        }
    }

    /// 权限规则标识
    pub fn rule(&self) -> String {
        format!("{}/{}", self.plugin, self.scope)
    }

    /// 订阅项键
    pub fn item_key(&self) -> String {
        format!("{}:{}", self.plugin, self.scope)
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.plugin, self.scope)
    }
}

#[derive(Clone)]
struct LocalListener {
    event: EventName,
    priority: i32,
    callback: Listener,
}

#[derive(Default)]
struct LocalRegistry {
    listeners: Vec<LocalListener>,
    commands: Vec<CommandInfo>,
}

/// 事件作用域
///
/// `destroy()` 幂等：重复调用只有首次生效，销毁后不再接受注册，
/// 也不会再被 EventBus 分发 (热重载时新作用域注册前旧的已完全退出)。
pub struct EventScope {
    id: ScopeId,
    policy: Arc<ScopePolicy>,
    bus: Arc<EventBus>,
    local: RwLock<LocalRegistry>,
    destroyed: AtomicBool,
}

impl EventScope {
    pub fn new(
        bus: Arc<EventBus>,
        plugin: impl Into<String>,
        scope: impl Into<String>,
        policy: ScopePolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ScopeId::new(plugin, scope),
            policy: Arc::new(policy),
            bus,
            local: RwLock::new(LocalRegistry::default()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &ScopeId {
        &self.id
    }

    pub fn policy(&self) -> &ScopePolicy {
        &self.policy
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// 注册监听器 (默认优先级)
    pub fn on(&self, event: EventName, callback: Listener) {
        self.on_priority(event, DEFAULT_PRIORITY, callback);
    }

    /// 注册监听器；优先级越大越先执行
    pub fn on_priority(&self, event: EventName, priority: i32, callback: Listener) {
        if self.is_destroyed() {
            warn!(target: "EventScope", "[{}] 已销毁，忽略监听器注册 {}", self.id, event);
            return;
        }
        self.local.write().unwrap().listeners.push(LocalListener {
            event: event.clone(),
            priority,
            callback: callback.clone(),
        });
        self.after_add_listener(event, priority, callback);
    }

    /// 模板方法钩子：本地副本落账后转发到 EventBus
    fn after_add_listener(&self, event: EventName, priority: i32, callback: Listener) {
        self.bus
            .on(event, self.id.clone(), self.policy.clone(), priority, callback);
    }

    /// 注销监听器 (按回调指针匹配)
    pub fn off(&self, event: &EventName, callback: &Listener) {
        self.local
            .write()
            .unwrap()
            .listeners
            .retain(|l| !(l.event == *event && Arc::ptr_eq(&l.callback, callback)));
        self.bus.off_listener(event, &self.id, callback);
    }

    /// 注册指令元信息；响应逻辑另行监听 `command/<指令名>`
    pub fn register_command(&self, info: CommandInfo) {
        if self.is_destroyed() {
            warn!(target: "EventScope", "[{}] 已销毁，忽略指令注册 {}", self.id, info.command);
            return;
        }
        self.local.write().unwrap().commands.push(info.clone());
        self.after_add_command(info);
    }

    fn after_add_command(&self, info: CommandInfo) {
        self.bus.add_command(info, &self.id);
    }

    pub fn remove_command(&self, command: &str) {
        self.local
            .write()
            .unwrap()
            .commands
            .retain(|c| c.command != command);
        self.bus.remove_command(command, &self.id);
    }

    /// 本地子事件分发 (不经过 EventBus)
    ///
    /// 与总线同样的优先级排序 + `resolved()` 短路算法，逐个内联等待；
    /// 回调错误记录日志后继续。
    pub async fn emit(&self, event: &EventName, payload: EventPayload) -> bool {
        let mut matched: Vec<LocalListener> = {
            let local = self.local.read().unwrap();
            local
                .listeners
                .iter()
                .filter(|l| l.event == *event)
                .cloned()
                .collect()
        };
        if matched.is_empty() {
            return false;
        }
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));

        let payload = Arc::new(payload);
        let resolver = Resolver::default();
        for entry in matched {
            let ctx = EventContext::new(event.clone(), payload.clone(), resolver.clone());
            if let Err(e) = (entry.callback)(ctx).await {
                error!(target: "EventScope", "[{}] 本地事件 {} 执行失败: {}", self.id, event, e);
            }
            if resolver.is_resolved() {
                return true;
            }
        }
        false
    }

    /// 策略预检：该发送者能否订阅此作用域
    ///
    /// EventBus 分发过滤与帮助菜单构建共用这一判断。
    pub fn is_allow_subscribe(&self, sender: &ChatIdentity) -> bool {
        self.policy.allows(sender)
    }

    /// 枚举本地监听器 (事件名, 优先级)
    pub fn listeners(&self) -> Vec<(EventName, i32)> {
        self.local
            .read()
            .unwrap()
            .listeners
            .iter()
            .map(|l| (l.event.clone(), l.priority))
            .collect()
    }

    /// 枚举本地指令
    pub fn commands(&self) -> Vec<CommandInfo> {
        self.local.read().unwrap().commands.clone()
    }

    /// 销毁作用域：从 EventBus 摘除全部监听器与指令
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.off_scope(&self.id);
        let mut local = self.local.write().unwrap();
        local.listeners.clear();
        local.commands.clear();
    }
}

/// 插件级事件句柄：插件默认作用域的特化封装
///
/// 额外提供帮助菜单生成与同插件子作用域的构建。
pub struct PluginEvent {
    scope: Arc<EventScope>,
}

impl PluginEvent {
    pub fn new(bus: Arc<EventBus>, plugin: impl Into<String>, policy: ScopePolicy) -> Self {
        Self {
            scope: EventScope::new(bus, plugin, DEFAULT_SCOPE, policy),
        }
    }

    pub fn scope(&self) -> &Arc<EventScope> {
        &self.scope
    }

    /// 同插件下的独立子作用域
    pub fn sub_scope(&self, name: impl Into<String>, policy: ScopePolicy) -> Arc<EventScope> {
        EventScope::new(
            self.scope.bus.clone(),
            self.scope.id.plugin.clone(),
            name,
            policy,
        )
    }

    /// 由本地指令副本生成帮助菜单文本
    pub fn command_menu(&self) -> String {
        self.scope
            .commands()
            .iter()
            .map(|c| {
                if c.help.is_empty() {
                    c.name.clone()
                } else {
                    format!("{}  {}", c.name, c.help)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl Deref for PluginEvent {
    type Target = EventScope;

    fn deref(&self) -> &Self::Target {
        &self.scope
    }
}
