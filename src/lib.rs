// lib.rs
//
// ================================================================================
// Xunbot Dispatch Core - 讯而有序
// Copyright (c) 2025-Present Xunbot Team
//
// 架构：事件总线 | 插件作用域 | 订阅继承 | 权限协作
// ================================================================================

#[macro_use]
pub mod log;

pub mod bus;
pub mod collab;
pub mod config;
pub mod error;
pub mod event;
pub mod identity;
pub mod scope;
pub mod subscription;

pub use bus::{CommandInfo, EventBus};
pub use collab::{AllowAllRoles, CacheStore, MemoryCache, RoleProvider, StaticRoleProvider};
pub use config::{AppConfig, CommandOverride};
pub use error::{BotError, BotResult};
pub use event::{
    DEFAULT_PRIORITY, EventContext, EventMeta, EventName, EventPayload, IncomingMessage, Listener,
    ReplySink, Resolver, listener,
};
pub use identity::{ChatIdentity, ChatType};
pub use scope::{DEFAULT_SCOPE, EventScope, PluginEvent, ScopeId, ScopePolicy};
pub use subscription::{SubscribeItem, SubscribeTarget, SubscriptionIndex};
