//! Command list and command execution packets.

use crate::protocol::{decoder, Decode, Decoder, Encode, Encoder};
use aquarelay_macros::{Decode, Encode};

#[derive(Debug, Clone, Encode, Decode)]
pub struct CommandRequest {
    pub command: String,
    /// Origin data, carried verbatim.
    #[encoding(length_prefix = "inferred")]
    pub ignored_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnum {
    pub name: String,
    /// Indexes into [`AvailableCommands::enum_values`].
    pub value_indexes: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ChainedSubcommandValue {
    pub index: u16,
    pub value_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct ChainedSubcommand {
    pub name: String,
    #[encoding(length_prefix = "varuint")]
    pub values: Vec<ChainedSubcommandValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CommandParameter {
    pub name: String,
    pub type_info: u32,
    pub optional: bool,
    pub flags: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CommandOverload {
    pub chaining: bool,
    #[encoding(length_prefix = "varuint")]
    pub parameters: Vec<CommandParameter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CommandData {
    pub name: String,
    pub description: String,
    pub flags: u16,
    pub permission: String,
    /// Index into [`AvailableCommands::enums`], or -1.
    pub alias_enum: i32,
    #[encoding(length_prefix = "varuint")]
    pub chained_subcommand_indexes: Vec<u16>,
    #[encoding(length_prefix = "varuint")]
    pub overloads: Vec<CommandOverload>,
}

/// The command list sent by the server.
///
/// Enum value indexes are written with the narrowest width able to address
/// every entry of `enum_values`, so the width changes as values are added.
/// Soft enums and enum constraints are not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableCommands {
    pub enum_values: Vec<String>,
    pub chained_subcommand_values: Vec<String>,
    pub postfixes: Vec<String>,
    pub enums: Vec<CommandEnum>,
    pub chained_subcommands: Vec<ChainedSubcommand>,
    pub commands: Vec<CommandData>,
    pub trailing_data: Vec<u8>,
}

/// Parameter type of a free-form trailing argument.
const RAW_TEXT_PARAMETER: u32 = 0x10_0046;

impl AvailableCommands {
    /// Registers a command with its aliases, unless a command with the same
    /// name is already listed. Returns whether the command was added.
    pub fn inject(&mut self, name: &str, description: &str, aliases: &[String]) -> bool {
        let name = name.to_lowercase();
        if self.commands.iter().any(|c| c.name == name) {
            return false;
        }

        let mut value_indexes = Vec::new();
        for alias in aliases.iter().map(|a| a.to_lowercase()).chain([name.clone()]) {
            if alias == "help" {
                continue;
            }
            let index = match self.enum_values.iter().position(|v| *v == alias) {
                Some(index) => index,
                None => {
                    self.enum_values.push(alias);
                    self.enum_values.len() - 1
                }
            };
            let index = u32::try_from(index).unwrap_or(u32::MAX);
            if !value_indexes.contains(&index) {
                value_indexes.push(index);
            }
        }

        let mut alias_enum = -1;
        if !value_indexes.is_empty() {
            self.enums.push(CommandEnum {
                name: format!("{}Aliases", capitalize(&name)),
                value_indexes,
            });
            alias_enum = i32::try_from(self.enums.len() - 1).unwrap_or(-1);
        }

        self.commands.push(CommandData {
            name,
            description: description.to_owned(),
            flags: 0,
            permission: "any".to_owned(),
            alias_enum,
            chained_subcommand_indexes: Vec::new(),
            overloads: vec![CommandOverload {
                chaining: false,
                parameters: vec![CommandParameter {
                    name: "args".to_owned(),
                    type_info: RAW_TEXT_PARAMETER,
                    optional: true,
                    flags: 0,
                }],
            }],
        });
        true
    }

    fn write_enum_index(&self, encoder: &mut Encoder, index: u32) {
        match self.enum_values.len() {
            0..=0xff => encoder.write_u8(index as u8),
            0x100..=0xffff => encoder.write_u16_le(index as u16),
            _ => encoder.write_u32_le(index),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn write_strings(encoder: &mut Encoder, strings: &[String]) {
    encoder.write_var_uint(strings.len().try_into().unwrap_or(u32::MAX));
    for s in strings {
        encoder.write_string(s);
    }
}

fn read_strings(decoder: &mut Decoder) -> decoder::Result<Vec<String>> {
    let count = decoder.read_var_uint()? as usize;
    let mut strings = Vec::with_capacity(count.min(decoder.buffer().len()));
    for _ in 0..count {
        strings.push(decoder.read_string()?.to_owned());
    }
    Ok(strings)
}

fn read_list<T: Decode>(decoder: &mut Decoder) -> decoder::Result<Vec<T>> {
    let count = decoder.read_var_uint()? as usize;
    let mut items = Vec::with_capacity(count.min(decoder.buffer().len()));
    for _ in 0..count {
        items.push(T::decode(decoder)?);
    }
    Ok(items)
}

impl Encode for AvailableCommands {
    fn encode(&self, encoder: &mut Encoder) {
        write_strings(encoder, &self.enum_values);
        write_strings(encoder, &self.chained_subcommand_values);
        write_strings(encoder, &self.postfixes);

        encoder.write_var_uint(self.enums.len().try_into().unwrap_or(u32::MAX));
        for command_enum in &self.enums {
            encoder.write_string(&command_enum.name);
            encoder.write_var_uint(
                command_enum
                    .value_indexes
                    .len()
                    .try_into()
                    .unwrap_or(u32::MAX),
            );
            for &index in &command_enum.value_indexes {
                self.write_enum_index(encoder, index);
            }
        }

        encoder.write_var_uint(self.chained_subcommands.len().try_into().unwrap_or(u32::MAX));
        for subcommand in &self.chained_subcommands {
            subcommand.encode(encoder);
        }
        encoder.write_var_uint(self.commands.len().try_into().unwrap_or(u32::MAX));
        for command in &self.commands {
            command.encode(encoder);
        }
        encoder.write_slice(&self.trailing_data);
    }
}

impl Decode for AvailableCommands {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        let enum_values = read_strings(decoder)?;
        let chained_subcommand_values = read_strings(decoder)?;
        let postfixes = read_strings(decoder)?;

        let enum_count = decoder.read_var_uint()? as usize;
        let mut enums = Vec::with_capacity(enum_count.min(decoder.buffer().len()));
        for _ in 0..enum_count {
            let name = decoder.read_string()?.to_owned();
            let count = decoder.read_var_uint()? as usize;
            let mut value_indexes = Vec::with_capacity(count.min(decoder.buffer().len()));
            for _ in 0..count {
                let index = match enum_values.len() {
                    0..=0xff => u32::from(decoder.read_u8()?),
                    0x100..=0xffff => u32::from(decoder.read_u16_le()?),
                    _ => decoder.read_u32_le()?,
                };
                value_indexes.push(index);
            }
            enums.push(CommandEnum {
                name,
                value_indexes,
            });
        }

        let chained_subcommands = read_list(decoder)?;
        let commands = read_list(decoder)?;
        let trailing_data = decoder.consume_rest().to_vec();

        Ok(Self {
            enum_values,
            chained_subcommand_values,
            postfixes,
            enums,
            chained_subcommands,
            commands,
            trailing_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AvailableCommands {
        AvailableCommands {
            enum_values: vec!["gamemode".to_owned(), "gm".to_owned()],
            chained_subcommand_values: Vec::new(),
            postfixes: Vec::new(),
            enums: vec![CommandEnum {
                name: "GamemodeAliases".to_owned(),
                value_indexes: vec![0, 1],
            }],
            chained_subcommands: Vec::new(),
            commands: Vec::new(),
            trailing_data: vec![0, 0],
        }
    }

    fn reencode(commands: &AvailableCommands) -> AvailableCommands {
        let mut buf = Vec::new();
        commands.encode(&mut Encoder::new(&mut buf));
        AvailableCommands::decode(&mut Decoder::new(&buf)).unwrap()
    }

    #[test]
    fn injected_command_survives_encoding() {
        let mut commands = sample();
        assert!(commands.inject("ProxyList", "Lists players", &["plist".to_owned()]));
        let decoded = reencode(&commands);
        assert_eq!(decoded, commands);

        let data = &decoded.commands[0];
        assert_eq!(data.name, "proxylist");
        assert_eq!(data.permission, "any");
        assert_eq!(data.alias_enum, 1);
        assert_eq!(decoded.enums[1].name, "ProxylistAliases");
        assert_eq!(decoded.enums[1].value_indexes, [2, 3]);
        assert_eq!(decoded.trailing_data, [0, 0]);
    }

    #[test]
    fn injection_skips_existing_and_help() {
        let mut commands = sample();
        assert!(commands.inject("stop", "", &["help".to_owned(), "gm".to_owned()]));
        assert!(!commands.inject("STOP", "", &[]));
        // "gm" is reused, "help" is never registered as an alias.
        assert_eq!(commands.enum_values, ["gamemode", "gm", "stop"]);
        assert_eq!(commands.enums[1].value_indexes, [1, 2]);
        assert_eq!(commands.commands.len(), 1);
    }

    #[test]
    fn index_width_grows_with_values() {
        let mut commands = sample();
        commands.enum_values = (0..300).map(|i| format!("v{i}")).collect();
        commands.enums[0].value_indexes = vec![0, 299];
        assert_eq!(reencode(&commands), commands);
    }
}
