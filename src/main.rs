use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use xunbot::{
    AllowAllRoles, AppConfig, BotResult, ChatIdentity, CommandInfo, EventBus, EventName,
    IncomingMessage, PluginEvent, ReplySink, ScopePolicy, SubscriptionIndex, info, listener,
};

/// 控制台回复出口：直接打印到终端
struct ConsoleReply;

#[async_trait]
impl ReplySink for ConsoleReply {
    async fn send_text(&self, text: &str) -> BotResult<()> {
        println!("<< {text}");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load_or_create("config.toml").await?;

    let subscriptions = Arc::new(SubscriptionIndex::with_file(&config.subscription_path));
    subscriptions.load().await?;

    let bus = EventBus::new(subscriptions, Arc::new(AllowAllRoles), &config);

    // 演示插件：echo 指令 + help 菜单
    let demo = PluginEvent::new(bus.clone(), "demo", ScopePolicy::auto());
    demo.register_command(
        CommandInfo::new("echo", "回声", "原样复读参数").with_aliases(vec!["say".to_string()]),
    );
    demo.register_command(CommandInfo::new("help", "帮助", "查看可用指令"));

    demo.on(
        EventName::command("echo"),
        listener(|ctx| async move {
            let param = ctx
                .payload
                .args
                .get("param")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            ctx.reply(&param).await?;
            ctx.resolve();
            Ok(())
        }),
    );

    let menu = demo.command_menu();
    demo.on(
        EventName::command("help"),
        listener(move |ctx| {
            let menu = menu.clone();
            async move {
                ctx.reply(&menu).await?;
                ctx.resolve();
                Ok(())
            }
        }),
    );

    info!(target: "Console", "控制台已就绪，每行输入视为一条私聊消息");

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let sender = ChatIdentity::private("console", "console-01", "console_user");
        let msg = IncomingMessage::new(sender, line).with_reply(Arc::new(ConsoleReply));
        if !bus.emit_message(msg).await {
            println!("<< 未知指令，输入 help 查看可用指令");
        }
    }
    Ok(())
}
