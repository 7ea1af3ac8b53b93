//! Proxy-side commands, typed by players or on the console.

use crate::{lang::Translator, permission::PermissionManager};
use ahash::AHashMap;
use std::collections::BTreeMap;

/// Name, aliases and permission of a command.
#[derive(Debug, Clone)]
pub struct CommandInfo {
    pub name: String,
    pub description: String,
    pub aliases: Vec<String>,
    /// Empty means everyone may run the command.
    pub permission: String,
}

impl CommandInfo {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            description: description.to_owned(),
            aliases: Vec::new(),
            permission: String::new(),
        }
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_lowercase());
        self
    }

    pub fn permission(mut self, permission: &str) -> Self {
        self.permission = permission.to_owned();
        self
    }
}

/// Who runs a command. Replies are buffered and delivered by the caller.
#[derive(Debug)]
pub struct CommandSender {
    name: String,
    console: bool,
    replies: Vec<String>,
}

impl CommandSender {
    pub fn console() -> Self {
        Self {
            name: "CONSOLE".to_owned(),
            console: true,
            replies: Vec::new(),
        }
    }

    pub fn player(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            console: false,
            replies: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_console(&self) -> bool {
        self.console
    }

    pub fn send_message(&mut self, message: impl Into<String>) {
        self.replies.push(message.into());
    }

    pub fn take_replies(&mut self) -> Vec<String> {
        std::mem::take(&mut self.replies)
    }

    pub fn has_permission(&self, permissions: &PermissionManager, permission: &str) -> bool {
        self.console || permission.is_empty() || permissions.has_permission(&self.name, permission)
    }
}

/// An online player as seen by commands.
#[derive(Debug, Clone)]
pub struct PlayerEntry {
    pub name: String,
    pub server: Option<String>,
}

/// Proxy state a command may read or act on.
pub struct CommandContext<'a> {
    pub translator: &'a dyn Translator,
    pub permissions: &'a PermissionManager,
    pub players: &'a [PlayerEntry],
    pub shutdown_requested: bool,
}

pub trait Command: Send + Sync {
    fn info(&self) -> &CommandInfo;

    fn execute(
        &self,
        sender: &mut CommandSender,
        args: &[&str],
        context: &mut CommandContext,
        commands: &CommandMap,
    );
}

#[derive(Default)]
pub struct CommandMap {
    commands: Vec<Box<dyn Command>>,
    /// Lowercase name or alias -> index into `commands`.
    lookup: AHashMap<String, usize>,
}

impl CommandMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A map holding the built-in commands.
    pub fn with_defaults() -> Self {
        let mut map = Self::new();
        map.register(Box::new(HelpCommand::new()));
        map.register(Box::new(ProxyListCommand::new()));
        map.register(Box::new(ProxyStopCommand::new()));
        map
    }

    /// Registers a command. Returns `false` if its name is taken; aliases
    /// that are taken are skipped.
    pub fn register(&mut self, command: Box<dyn Command>) -> bool {
        let info = command.info();
        let name = info.name.to_lowercase();
        if self.lookup.contains_key(&name) {
            return false;
        }
        let index = self.commands.len();
        self.lookup.insert(name, index);
        for alias in &info.aliases {
            self.lookup.entry(alias.to_lowercase()).or_insert(index);
        }
        self.commands.push(command);
        true
    }

    pub fn get(&self, label: &str) -> Option<&dyn Command> {
        self.lookup
            .get(&label.to_lowercase())
            .map(|&index| self.commands[index].as_ref())
    }

    pub fn commands(&self) -> impl Iterator<Item = &dyn Command> {
        self.commands.iter().map(|c| c.as_ref())
    }

    /// Label of a command line, without the leading slash.
    pub fn label(line: &str) -> Option<String> {
        let label = line.trim().split(' ').next()?;
        let label = label.strip_prefix('/').unwrap_or(label).to_lowercase();
        (!label.is_empty()).then_some(label)
    }

    /// Runs a command line. Returns whether a command was executed.
    pub fn dispatch(&self, sender: &mut CommandSender, line: &str, context: &mut CommandContext) -> bool {
        let Some(label) = Self::label(line) else {
            return false;
        };
        let args: Vec<&str> = line.trim().split(' ').skip(1).filter(|a| !a.is_empty()).collect();

        let Some(command) = self.get(&label) else {
            sender.send_message(context.translator.translate("command.unknown", &[&label]));
            return false;
        };
        if !sender.has_permission(context.permissions, &command.info().permission) {
            sender.send_message(context.translator.translate("command.no_permission", &[]));
            return false;
        }

        tracing::debug!("{} issued proxy command /{label}", sender.name());
        command.execute(sender, &args, context, self);
        true
    }
}

struct HelpCommand(CommandInfo);

impl HelpCommand {
    fn new() -> Self {
        Self(CommandInfo::new("help", "Lists proxy commands").alias("?"))
    }
}

impl Command for HelpCommand {
    fn info(&self) -> &CommandInfo {
        &self.0
    }

    fn execute(&self, sender: &mut CommandSender, _args: &[&str], context: &mut CommandContext, commands: &CommandMap) {
        let mut visible: Vec<&CommandInfo> = commands
            .commands()
            .map(Command::info)
            .filter(|info| sender.has_permission(context.permissions, &info.permission))
            .collect();
        visible.sort_by(|a, b| a.name.cmp(&b.name));
        for info in visible {
            sender.send_message(format!("§6/{}§r: {}", info.name, info.description));
        }
    }
}

struct ProxyListCommand(CommandInfo);

impl ProxyListCommand {
    fn new() -> Self {
        Self(
            CommandInfo::new("proxylist", "Shows players in proxy")
                .alias("plist")
                .permission("aquarelay.command.proxylist"),
        )
    }
}

impl Command for ProxyListCommand {
    fn info(&self) -> &CommandInfo {
        &self.0
    }

    fn execute(&self, sender: &mut CommandSender, _args: &[&str], context: &mut CommandContext, _commands: &CommandMap) {
        let mut by_server: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for player in context.players {
            let server = player.server.as_deref().unwrap_or("-");
            by_server.entry(server).or_default().push(&player.name);
        }
        for (server, names) in by_server {
            let names = names.join(", ");
            sender.send_message(context.translator.translate("command.proxylist.server", &[server, &names]));
        }
        let total = context.players.len().to_string();
        sender.send_message(context.translator.translate("command.proxylist.total", &[&total]));
    }
}

struct ProxyStopCommand(CommandInfo);

impl ProxyStopCommand {
    fn new() -> Self {
        Self(
            CommandInfo::new("proxystop", "Stops the proxy server")
                .alias("ps")
                .permission("aquarelay.command.proxystop"),
        )
    }
}

impl Command for ProxyStopCommand {
    fn info(&self) -> &CommandInfo {
        &self.0
    }

    fn execute(&self, sender: &mut CommandSender, _args: &[&str], context: &mut CommandContext, _commands: &CommandMap) {
        sender.send_message(context.translator.translate("proxy.stopping", &[]));
        context.shutdown_requested = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::Language;

    fn players() -> Vec<PlayerEntry> {
        vec![
            PlayerEntry {
                name: "Steve".to_owned(),
                server: Some("lobby".to_owned()),
            },
            PlayerEntry {
                name: "Alex".to_owned(),
                server: Some("lobby".to_owned()),
            },
            PlayerEntry {
                name: "Herobrine".to_owned(),
                server: Some("survival".to_owned()),
            },
        ]
    }

    #[test]
    fn label_strips_slash_and_case() {
        assert_eq!(CommandMap::label("  /PList extra").as_deref(), Some("plist"));
        assert_eq!(CommandMap::label("   "), None);
        assert_eq!(CommandMap::label("/"), None);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut map = CommandMap::with_defaults();
        assert!(!map.register(Box::new(ProxyStopCommand::new())));
        assert!(map.get("PS").is_some());
    }

    #[test]
    fn proxylist_groups_by_server() {
        let map = CommandMap::with_defaults();
        let language = Language::english();
        let permissions = PermissionManager::new();
        let players = players();
        let mut context = CommandContext {
            translator: &language,
            permissions: &permissions,
            players: &players,
            shutdown_requested: false,
        };
        let mut console = CommandSender::console();
        assert!(map.dispatch(&mut console, "/plist", &mut context));
        assert_eq!(
            console.take_replies(),
            [
                "§7(§blobby§7): §fSteve, Alex",
                "§7(§bsurvival§7): §fHerobrine",
                "§3Online players: §f3",
            ]
        );
    }

    #[test]
    fn player_needs_permission() {
        let map = CommandMap::with_defaults();
        let language = Language::english();
        let mut permissions = PermissionManager::new();
        let players = players();
        let mut context = CommandContext {
            translator: &language,
            permissions: &permissions,
            players: &players,
            shutdown_requested: false,
        };
        let mut steve = CommandSender::player("Steve");
        assert!(!map.dispatch(&mut steve, "proxystop", &mut context));
        assert!(!context.shutdown_requested);
        assert_eq!(
            steve.take_replies(),
            [language.translate("command.no_permission", &[])]
        );

        permissions.grant("steve", "aquarelay.command.*");
        let mut context = CommandContext {
            translator: &language,
            permissions: &permissions,
            players: &players,
            shutdown_requested: false,
        };
        assert!(map.dispatch(&mut steve, "ps", &mut context));
        assert!(context.shutdown_requested);
    }

    #[test]
    fn unknown_command_replies() {
        let map = CommandMap::with_defaults();
        let language = Language::english();
        let permissions = PermissionManager::new();
        let mut context = CommandContext {
            translator: &language,
            permissions: &permissions,
            players: &[],
            shutdown_requested: false,
        };
        let mut console = CommandSender::console();
        assert!(!map.dispatch(&mut console, "/nope", &mut context));
        assert!(console.take_replies()[0].contains("nope"));
    }

    #[test]
    fn help_lists_permitted_commands() {
        let map = CommandMap::with_defaults();
        let language = Language::english();
        let permissions = PermissionManager::new();
        let mut context = CommandContext {
            translator: &language,
            permissions: &permissions,
            players: &[],
            shutdown_requested: false,
        };
        let mut player = CommandSender::player("Alex");
        assert!(map.dispatch(&mut player, "help", &mut context));
        assert_eq!(player.take_replies(), ["§6/help§r: Lists proxy commands"]);
    }
}
