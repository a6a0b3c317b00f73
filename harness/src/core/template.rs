//! Placeholder substitution for command templates.
//!
//! Runner and judge commands are shell strings with `{{prompt}}` and
//! `{{prompt_file}}` placeholders; command environments wrap commands with
//! `{{command}}`. Substitution is literal replacement, nothing more.

use std::path::Path;

pub const PROMPT: &str = "{{prompt}}";
pub const PROMPT_FILE: &str = "{{prompt_file}}";
pub const COMMAND: &str = "{{command}}";

/// True when the template can receive a prompt.
pub fn has_prompt_placeholder(template: &str) -> bool {
    template.contains(PROMPT) || template.contains(PROMPT_FILE)
}

/// Substitute `{{prompt_file}}` with the quoted path and `{{prompt}}` with the
/// quoted prompt text.
///
/// The file placeholder is replaced first so prompt text that happens to
/// contain `{{prompt_file}}` is left alone.
pub fn substitute_prompt(template: &str, prompt: &str, prompt_file: &Path) -> String {
    let file = shell_quote(&prompt_file.to_string_lossy());
    template
        .replace(PROMPT_FILE, &file)
        .replace(PROMPT, &shell_quote(prompt))
}

/// Substitute `{{command}}` with the quoted command string.
pub fn substitute_command(template: &str, command: &str) -> String {
    template.replace(COMMAND, &shell_quote(command))
}

/// Quote `input` for a POSIX shell. Plain words pass through untouched.
pub fn shell_quote(input: &str) -> String {
    if !input.is_empty()
        && input
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '/' | ':'))
    {
        return input.to_string();
    }
    let mut escaped = String::from("'");
    for ch in input.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_inline_prompt() {
        let out = substitute_prompt("agent -p {{prompt}}", "fix it's bug", Path::new("/tmp/p"));
        assert_eq!(out, "agent -p 'fix it'\"'\"'s bug'");
    }

    #[test]
    fn substitutes_prompt_file_path() {
        let out = substitute_prompt(
            "judge --input {{prompt_file}}",
            "ignored",
            Path::new("/tmp/prompt.md"),
        );
        assert_eq!(out, "judge --input /tmp/prompt.md");
    }

    #[test]
    fn prompt_text_containing_placeholder_is_not_expanded() {
        let out = substitute_prompt("run {{prompt}}", "see {{prompt_file}}", Path::new("/p"));
        assert_eq!(out, "run 'see {{prompt_file}}'");
    }

    #[test]
    fn empty_input_is_quoted() {
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn wraps_command_for_exec_template() {
        let out = substitute_command("docker exec box sh -c {{command}}", "cargo test && ls");
        assert_eq!(out, "docker exec box sh -c 'cargo test && ls'");
    }

    #[test]
    fn detects_placeholders() {
        assert!(has_prompt_placeholder("x {{prompt}}"));
        assert!(has_prompt_placeholder("x {{prompt_file}}"));
        assert!(!has_prompt_placeholder("x {{command}}"));
    }
}
