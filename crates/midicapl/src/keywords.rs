//! Keyword spellings and command classification.
//!
//! Every command keyword can be re-spelled with `DEFINE`, so the compiler
//! never matches on string literals after the definitions pass. Pass 1
//! collects the redefinitions and builds one immutable [`KeywordTable`];
//! every later pass resolves a line's first column through it exactly once
//! and works with [`CommandKind`] from then on.

use std::collections::HashMap;

use crate::error::{CompileError, Result};

/// Every command the dispatcher can route. Channel commands are resolved
/// separately because their selector is a channel number, not a keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    // Mode commands
    Instruments,
    Meta,
    Function,
    Pattern,
    End,
    // Root-level commands
    Define,
    Const,
    Var,
    Chord,
    Include,
    Soundbank,
    Call,
    Global,
    // Block braces
    BlockOpen,
    BlockClose,
}

impl CommandKind {
    /// The canonical spelling used in error messages.
    pub fn canonical(&self) -> &'static str {
        match self {
            CommandKind::Instruments => "INSTRUMENTS",
            CommandKind::Meta => "META",
            CommandKind::Function => "FUNCTION",
            CommandKind::Pattern => "PATTERN",
            CommandKind::End => "END",
            CommandKind::Define => "DEFINE",
            CommandKind::Const => "CONST",
            CommandKind::Var => "VAR",
            CommandKind::Chord => "CHORD",
            CommandKind::Include => "INCLUDE",
            CommandKind::Soundbank => "SOUNDBANK",
            CommandKind::Call => "CALL",
            CommandKind::Global => "GLOBAL",
            CommandKind::BlockOpen => "{",
            CommandKind::BlockClose => "}",
        }
    }

    fn all() -> &'static [CommandKind] {
        &[
            CommandKind::Instruments,
            CommandKind::Meta,
            CommandKind::Function,
            CommandKind::Pattern,
            CommandKind::End,
            CommandKind::Define,
            CommandKind::Const,
            CommandKind::Var,
            CommandKind::Chord,
            CommandKind::Include,
            CommandKind::Soundbank,
            CommandKind::Call,
            CommandKind::Global,
            CommandKind::BlockOpen,
            CommandKind::BlockClose,
        ]
    }
}

/// Spelling -> command lookup plus the configurable option separators.
///
/// Built once per compile; never mutated after the definitions pass.
#[derive(Debug, Clone)]
pub struct KeywordTable {
    spellings: HashMap<String, CommandKind>,
    /// Separator between options in an option string (default `,`).
    pub opt_separator: String,
    /// Assignment marker inside an option (default `=`).
    pub opt_assigner: String,
}

impl Default for KeywordTable {
    fn default() -> Self {
        let mut spellings = HashMap::new();
        for kind in CommandKind::all() {
            spellings.insert(kind.canonical().to_string(), *kind);
        }
        KeywordTable {
            spellings,
            opt_separator: ",".to_string(),
            opt_assigner: "=".to_string(),
        }
    }
}

impl KeywordTable {
    /// Resolve a line's first column to a command, if it is one.
    pub fn lookup(&self, spelling: &str) -> Option<CommandKind> {
        self.spellings.get(spelling).copied()
    }

    /// Apply one `DEFINE <command> <spelling>` redefinition. The command is
    /// named by its *current* spelling, so chained redefinitions work in
    /// file order.
    pub fn redefine(&mut self, command: &str, new_spelling: &str) -> Result<()> {
        match command {
            "OPT_SEPARATOR" => {
                self.opt_separator = new_spelling.to_string();
                return Ok(());
            }
            "OPT_ASSIGNER" => {
                self.opt_assigner = new_spelling.to_string();
                return Ok(());
            }
            _ => {}
        }

        let kind = self.spellings.remove(command).ok_or_else(|| {
            CompileError::syntax(format!("DEFINE: unknown command: {command}"))
        })?;
        if self.spellings.contains_key(new_spelling) {
            return Err(CompileError::semantic(format!(
                "DEFINE: spelling already in use: {new_spelling}"
            )));
        }
        self.spellings.insert(new_spelling.to_string(), kind);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spellings() {
        let table = KeywordTable::default();
        assert_eq!(table.lookup("INSTRUMENTS"), Some(CommandKind::Instruments));
        assert_eq!(table.lookup("CALL"), Some(CommandKind::Call));
        assert_eq!(table.lookup("{"), Some(CommandKind::BlockOpen));
        assert_eq!(table.lookup("0"), None);
    }

    #[test]
    fn test_redefine() {
        let mut table = KeywordTable::default();
        table.redefine("CHORD", "CRD").unwrap();
        assert_eq!(table.lookup("CRD"), Some(CommandKind::Chord));
        assert_eq!(table.lookup("CHORD"), None);
    }

    #[test]
    fn test_redefine_chain_uses_current_spelling() {
        let mut table = KeywordTable::default();
        table.redefine("CHORD", "CRD").unwrap();
        table.redefine("CRD", "ACCORD").unwrap();
        assert_eq!(table.lookup("ACCORD"), Some(CommandKind::Chord));
    }

    #[test]
    fn test_redefine_unknown_command() {
        let mut table = KeywordTable::default();
        let err = table.redefine("NOSUCH", "X").unwrap_err();
        assert!(err.message.contains("unknown command"));
    }

    #[test]
    fn test_redefine_collision() {
        let mut table = KeywordTable::default();
        let err = table.redefine("CHORD", "CALL").unwrap_err();
        assert!(err.message.contains("already in use"));
    }

    #[test]
    fn test_redefine_separators() {
        let mut table = KeywordTable::default();
        table.redefine("OPT_SEPARATOR", ";").unwrap();
        table.redefine("OPT_ASSIGNER", ":").unwrap();
        assert_eq!(table.opt_separator, ";");
        assert_eq!(table.opt_assigner, ":");
    }
}
