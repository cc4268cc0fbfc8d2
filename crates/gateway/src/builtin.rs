//! Commands every deployment gets: `ping`, `help` and `status`.

use std::{
    fmt::Write as _,
    sync::{Arc, Weak},
    time::Instant,
};

use {
    parley_commands::{Command, CommandContext, Dispatcher},
    parley_common::Result,
    parley_session::SessionManager,
};

pub const PING_COOLDOWN_MS: u64 = 3_000;

/// Register the built-in commands. Handlers that need the dispatcher hold a
/// weak reference, since the dispatcher owns the handlers.
pub fn register_builtins(
    dispatcher: &Arc<Dispatcher>,
    session: SessionManager,
    started_at: Instant,
) -> Result<()> {
    dispatcher.register(
        Command::new("ping")
            .alias("p")
            .cooldown_ms(PING_COOLDOWN_MS)
            .category("utility")
            .description("Check that the bot is alive")
            .handler_fn(|ctx: CommandContext| async move {
                ctx.reply("pong").await?;
                Ok(())
            }),
    )?;

    let weak = Arc::downgrade(dispatcher);
    dispatcher.register(
        Command::new("help")
            .alias("h")
            .alias("menu")
            .category("utility")
            .description("List commands, or show how to use one")
            .usage("help [command]")
            .handler_fn(move |ctx: CommandContext| {
                let weak = Weak::clone(&weak);
                async move {
                    let Some(dispatcher) = weak.upgrade() else {
                        return Ok(());
                    };
                    let text = match ctx.args.first() {
                        Some(name) => describe(&dispatcher, name),
                        None => menu(&dispatcher),
                    };
                    ctx.reply(&text).await?;
                    Ok(())
                }
            }),
    )?;

    let weak = Arc::downgrade(dispatcher);
    dispatcher.register(
        Command::new("status")
            .category("utility")
            .description("Show session state, uptime and command usage")
            .handler_fn(move |ctx: CommandContext| {
                let weak = Weak::clone(&weak);
                let session = session.clone();
                async move {
                    let snapshot = session.snapshot();
                    let mut text = format!(
                        "State: {}\nUptime: {}",
                        snapshot.state,
                        format_duration(started_at.elapsed().as_secs())
                    );
                    if let Some(dispatcher) = weak.upgrade() {
                        let _ = write!(
                            text,
                            "\nCommands: {}\nExecuted: {}",
                            dispatcher.len(),
                            dispatcher.executed()
                        );
                        for usage in dispatcher.usage().iter().take(3) {
                            let _ = write!(text, "\n  {} x{}", usage.command, usage.count);
                        }
                    }
                    ctx.reply(&text).await?;
                    Ok(())
                }
            }),
    )?;

    Ok(())
}

fn menu(dispatcher: &Dispatcher) -> String {
    let prefix = dispatcher.prefix();
    let mut text = String::from("Available commands:");
    for (category, commands) in dispatcher.list() {
        let _ = write!(text, "\n\n*{category}*");
        for cmd in commands {
            let _ = write!(text, "\n{prefix}{}", cmd.name);
            if !cmd.description.is_empty() {
                let _ = write!(text, " - {}", cmd.description);
            }
        }
    }
    let _ = write!(text, "\n\nType {prefix}help <command> for details.");
    text
}

fn describe(dispatcher: &Dispatcher, name: &str) -> String {
    let prefix = dispatcher.prefix();
    let Some(cmd) = dispatcher.resolve(name) else {
        return format!("Unknown command: {name}");
    };
    let mut text = format!("{prefix}{}", cmd.name);
    if !cmd.description.is_empty() {
        let _ = write!(text, "\n{}", cmd.description);
    }
    if !cmd.usage.is_empty() {
        let _ = write!(text, "\nUsage: {prefix}{}", cmd.usage);
    }
    if !cmd.aliases.is_empty() {
        let aliases: Vec<String> = cmd.aliases.iter().map(|a| format!("{prefix}{a}")).collect();
        let _ = write!(text, "\nAliases: {}", aliases.join(", "));
    }
    if cmd.cooldown_ms > 0 {
        let _ = write!(text, "\nCooldown: {}s", cmd.cooldown_ms.div_ceil(1_000));
    }
    text
}

fn format_duration(secs: u64) -> String {
    let (days, hours, mins) = (secs / 86_400, secs % 86_400 / 3_600, secs % 3_600 / 60);
    match (days, hours) {
        (0, 0) => format!("{mins}m {}s", secs % 60),
        (0, _) => format!("{hours}h {mins}m"),
        _ => format!("{days}d {hours}h {mins}m"),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testing::{Offline, Recorder},
        parley_common::{InboundEvent, Outbound},
        parley_config::{CommandsConfig, SessionConfig},
        tokio::sync::mpsc,
    };

    fn setup() -> (Arc<Dispatcher>, Arc<Recorder>) {
        let out = Arc::new(Recorder::default());
        let dispatcher = Arc::new(Dispatcher::new(
            &CommandsConfig::default(),
            Arc::clone(&out) as Arc<dyn Outbound>,
        ));
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = SessionManager::new(&SessionConfig::default(), Arc::new(Offline), tx);
        register_builtins(&dispatcher, session, Instant::now()).unwrap();
        (dispatcher, out)
    }

    fn msg(body: &str) -> Arc<InboundEvent> {
        Arc::new(InboundEvent::text("chat-1", "alice", body))
    }

    #[tokio::test]
    async fn ping_alias_respects_cooldown() {
        let (dispatcher, out) = setup();
        let t = 1_000_000;
        assert!(dispatcher.dispatch_at(msg("!p"), t).await);
        assert!(!dispatcher.dispatch_at(msg("!p"), t + 1_000).await);
        assert!(dispatcher.dispatch_at(msg("!PING"), t + 5_000).await);
        assert_eq!(out.texts(), vec!["pong", "pong"]);
    }

    #[tokio::test]
    async fn help_lists_and_describes() {
        let (dispatcher, out) = setup();
        assert!(dispatcher.dispatch(msg("!menu")).await);
        assert!(dispatcher.dispatch(msg("!h ping")).await);
        assert!(dispatcher.dispatch(msg("!help nope")).await);

        let sent = out.texts();
        assert!(sent[0].contains("*utility*"));
        assert!(sent[0].contains("!ping - Check that the bot is alive"));
        assert!(sent[1].contains("Aliases: !p"));
        assert!(sent[1].contains("Cooldown: 3s"));
        assert_eq!(sent[2], "Unknown command: nope");
    }

    #[tokio::test]
    async fn status_reports_session_and_usage() {
        let (dispatcher, out) = setup();
        assert!(dispatcher.dispatch(msg("!ping")).await);
        assert!(dispatcher.dispatch(msg("!status")).await);

        let sent = out.texts();
        let status = &sent[1];
        assert!(status.contains("State: disconnected"));
        assert!(status.contains("Commands: 3"));
        assert!(status.contains("ping x1"));
    }

    #[test]
    fn durations_read_naturally() {
        assert_eq!(format_duration(59), "0m 59s");
        assert_eq!(format_duration(3_725), "1h 2m");
        assert_eq!(format_duration(90_061), "1d 1h 1m");
    }
}
