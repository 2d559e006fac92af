//! Platform-aware shell command allowlist.
//!
//! Only explicitly permitted commands may run. The gate consults the
//! first token of each command segment (and the wrapped subcommand for
//! shells like `bash -c`); a handful of commands get extra validation
//! with their own rules (`pkill`, `chmod`, `taskkill`, init scripts).
//!
//! The gate runs before the autonomy and risk gates. A denial is final:
//! it produces a TOOL_BLOCKED event and the agent must choose another
//! path.

use std::collections::HashSet;

use regex::Regex;

/// Gate verdict for one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny { reason: String },
}

impl Verdict {
    pub fn deny(reason: impl Into<String>) -> Self {
        Verdict::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Target platform for allowlist selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Unix,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }
}

/// Commands permitted on every platform.
const COMMON_COMMANDS: &[&str] = &[
    // File inspection
    "ls", "cat", "head", "tail", "wc", "grep", // File operations
    "cp", "mkdir", // Directory
    "pwd", // Node development
    "npm", "node", "npx", // Version control
    "git", // Process management
    "ps", "sleep", "timeout", // Python
    "python", "python3", "pip", "pip3", // Other
    "curl", "echo",
];

const UNIX_COMMANDS: &[&str] = &["chmod", "pkill", "lsof", "sh", "bash", "init.sh"];

const WINDOWS_COMMANDS: &[&str] = &[
    "dir", "type", "copy", "md", "taskkill", "where", "start", "cmd", "powershell", "init.bat",
    "init.ps1",
];

/// Dev-server processes `pkill` may always target.
const ALLOWED_KILL_TARGETS: &[&str] = &[
    "vite",
    "next",
    "webpack",
    "esbuild",
    "parcel",
    "rollup",
    "tsc",
    "jest",
    "vitest",
    "playwright",
    "cypress",
    "uvicorn",
    "gunicorn",
    "flask",
    "django",
    "fastapi",
    "streamlit",
];

/// Processes the harness itself runs under; killing them outright would
/// take the orchestrator down.
const PROTECTED_PROCESSES: &[&str] = &["python", "python3", "node"];

pub struct SecurityGate {
    platform: Platform,
    allowed: HashSet<&'static str>,
    needs_validation: HashSet<&'static str>,
}

impl SecurityGate {
    pub fn new(platform: Platform) -> Self {
        let mut allowed: HashSet<&'static str> = COMMON_COMMANDS.iter().copied().collect();
        let needs_validation: HashSet<&'static str> = match platform {
            Platform::Unix => {
                allowed.extend(UNIX_COMMANDS);
                ["pkill", "chmod", "init.sh", "bash", "sh"]
                    .into_iter()
                    .collect()
            }
            Platform::Windows => {
                allowed.extend(WINDOWS_COMMANDS);
                ["taskkill", "init.bat", "init.ps1", "powershell", "cmd"]
                    .into_iter()
                    .collect()
            }
        };
        Self {
            platform,
            allowed,
            needs_validation,
        }
    }

    /// Validate a full shell command line. Compound commands are split
    /// and every segment must pass.
    pub fn check_command(&self, command: &str) -> Verdict {
        let commands = extract_commands(command);
        if commands.is_empty() {
            return Verdict::deny(format!(
                "Could not parse command for security validation: {command}"
            ));
        }

        let segments = split_segments(command);

        for cmd in &commands {
            if cmd == "cd" {
                return Verdict::deny(
                    "'cd' is not allowed. The agent runs in a fixed root; \
                     use relative paths or flags like '--prefix' for npm or '-C' for git",
                );
            }

            if !self.allowed.contains(cmd.as_str()) {
                return Verdict::deny(format!(
                    "Command '{cmd}' is not in the allowed commands list for this platform"
                ));
            }

            if self.needs_validation.contains(cmd.as_str()) {
                let segment = segment_containing(cmd, &segments)
                    .unwrap_or_else(|| command.to_string());
                let verdict = match cmd.as_str() {
                    "pkill" => validate_pkill(&segment),
                    "chmod" => validate_chmod(&segment),
                    "taskkill" => validate_taskkill(&segment),
                    "init.sh" | "init.bat" | "init.ps1" => {
                        validate_init_script(&segment, self.platform)
                    }
                    "bash" | "sh" | "cmd" | "powershell" => self.validate_wrapper(&segment),
                    _ => Verdict::Allow,
                };
                if !verdict.is_allow() {
                    return verdict;
                }
            }
        }

        Verdict::Allow
    }

    /// Shell wrappers must carry an explicit subcommand, which is then
    /// validated against the same allowlist.
    fn validate_wrapper(&self, segment: &str) -> Verdict {
        let tokens = tokenize(segment);
        let Some(wrapper) = tokens.first() else {
            return Verdict::deny("Empty wrapper command");
        };
        let wrapper = wrapper.to_lowercase();

        let subcommand = match wrapper.as_str() {
            "bash" | "sh" => {
                let Some(pos) = tokens.iter().position(|t| t == "-c") else {
                    return Verdict::deny(format!("{wrapper} requires -c with a subcommand"));
                };
                tokens.get(pos + 1..).map(|rest| rest.join(" "))
            }
            "cmd" => {
                let lowered: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
                let pos = lowered
                    .iter()
                    .position(|t| t == "/c" || t == "/k");
                let Some(pos) = pos else {
                    return Verdict::deny("cmd requires /c or /k with a subcommand");
                };
                tokens.get(pos + 1..).map(|rest| rest.join(" "))
            }
            "powershell" => {
                let lowered: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
                if lowered.contains(&"-file".to_string()) {
                    return validate_init_script(segment, self.platform);
                }
                let Some(pos) = lowered.iter().position(|t| t == "-command") else {
                    return Verdict::deny("powershell requires -File or -Command");
                };
                tokens.get(pos + 1..).map(|rest| rest.join(" "))
            }
            other => return Verdict::deny(format!("Unknown wrapper command: {other}")),
        };

        match subcommand {
            Some(sub) if !sub.trim().is_empty() => self.check_command(&sub),
            _ => Verdict::deny(format!("{wrapper} requires a subcommand")),
        }
    }
}

impl Default for SecurityGate {
    fn default() -> Self {
        Self::new(Platform::current())
    }
}

/// Split a compound command into segments on `&&`, `||`, and `;`.
/// Pipes stay within one segment.
fn split_segments(command: &str) -> Vec<String> {
    let chain = Regex::new(r"\s*(?:&&|\|\||;)\s*").expect("static regex");
    chain
        .split(command)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extract base command names from a shell string, walking pipes and
/// chains. Returns an empty list when parsing fails (fail closed).
fn extract_commands(command: &str) -> Vec<String> {
    const SHELL_KEYWORDS: &[&str] = &[
        "if", "then", "else", "elif", "fi", "for", "while", "until", "do", "done", "case", "esac",
        "in", "!", "{", "}",
    ];

    let mut commands = Vec::new();
    for segment in split_segments(command) {
        let tokens = tokenize(&segment);
        if tokens.is_empty() && !segment.trim().is_empty() {
            return Vec::new(); // unclosed quote or similar
        }

        let mut expect_command = true;
        for token in tokens {
            if token == "|" || token == "&" {
                expect_command = true;
                continue;
            }
            if SHELL_KEYWORDS.contains(&token.as_str()) {
                continue;
            }
            if token.starts_with('-') {
                continue;
            }
            // VAR=value assignments precede the command proper.
            if token.contains('=') && !token.starts_with('=') {
                continue;
            }
            if expect_command {
                let base = token
                    .rsplit(['/', '\\'])
                    .next()
                    .unwrap_or(&token)
                    .to_lowercase();
                commands.push(base);
                expect_command = false;
            }
        }
    }
    commands
}

/// Quote-aware whitespace tokenizer. Returns an empty vec on unclosed
/// quotes so callers fail closed.
fn tokenize(input: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in input.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                } else {
                    current.push(ch);
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            },
        }
    }

    if quote.is_some() {
        return Vec::new();
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

fn segment_containing(cmd: &str, segments: &[String]) -> Option<String> {
    segments
        .iter()
        .find(|segment| extract_commands(segment).iter().any(|c| c == cmd))
        .cloned()
}

/// `pkill` rules: direct kills of python/node are blocked (they would
/// take down the harness); `-f` with a specific script is fine; known
/// dev-server processes are always fine.
fn validate_pkill(segment: &str) -> Verdict {
    let tokens = tokenize(segment);
    if tokens.is_empty() {
        return Verdict::deny("Could not parse pkill command");
    }

    let has_f_flag = tokens.iter().any(|t| t == "-f");
    let args: Vec<&String> = tokens[1..].iter().filter(|t| !t.starts_with('-')).collect();
    let Some(target) = args.last() else {
        return Verdict::deny("pkill requires a process name");
    };
    let target_lower = target.to_lowercase();

    if has_f_flag && target.contains(' ') {
        let mut parts = target.splitn(2, ' ');
        let base = parts.next().unwrap_or_default().to_lowercase();
        let script = parts.next().unwrap_or_default();
        if PROTECTED_PROCESSES.contains(&base.as_str()) {
            if script.is_empty() {
                return Verdict::deny(format!(
                    "'pkill -f {base}' requires a script name (e.g. 'pkill -f \"{base} app.py\"')"
                ));
            }
            return Verdict::Allow;
        }
    }

    if PROTECTED_PROCESSES.contains(&target_lower.as_str()) {
        return Verdict::deny(format!(
            "'pkill {target}' would kill the orchestrator itself. \
             Use 'pkill -f \"{target} your_script\"' to kill a specific process"
        ));
    }

    if ALLOWED_KILL_TARGETS.contains(&target_lower.as_str()) {
        return Verdict::Allow;
    }

    if has_f_flag {
        return Verdict::Allow;
    }

    Verdict::deny(
        "pkill only allowed for dev server processes or with -f for specific scripts",
    )
}

/// `chmod` is restricted to `+x` modes with no flags.
fn validate_chmod(segment: &str) -> Verdict {
    let tokens = tokenize(segment);
    if tokens.first().map(String::as_str) != Some("chmod") {
        return Verdict::deny("Not a chmod command");
    }

    let mut mode: Option<&String> = None;
    let mut files = 0usize;
    for token in &tokens[1..] {
        if token.starts_with('-') {
            return Verdict::deny("chmod flags are not allowed");
        }
        if mode.is_none() {
            mode = Some(token);
        } else {
            files += 1;
        }
    }

    let Some(mode) = mode else {
        return Verdict::deny("chmod requires a mode");
    };
    if files == 0 {
        return Verdict::deny("chmod requires at least one file");
    }

    let exec_mode = Regex::new(r"^[ugoa]*\+x$").expect("static regex");
    if !exec_mode.is_match(mode) {
        return Verdict::deny(format!("chmod only allowed with +x mode, got: {mode}"));
    }
    Verdict::Allow
}

/// `taskkill` (Windows): must target by image name; protected processes
/// need a /FI filter; killing by PID is never allowed.
fn validate_taskkill(segment: &str) -> Verdict {
    let tokens = tokenize(segment);
    if tokens.is_empty() {
        return Verdict::deny("Could not parse taskkill command");
    }
    let lowered: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();

    let has_filter = lowered.contains(&"/fi".to_string());

    let process = lowered
        .iter()
        .position(|t| t == "/im")
        .and_then(|i| lowered.get(i + 1));
    let Some(process) = process else {
        if lowered.contains(&"/pid".to_string()) {
            return Verdict::deny("taskkill by PID is not allowed; use /IM with a process name");
        }
        return Verdict::deny("taskkill must specify a process with /IM");
    };

    let stem = process.trim_end_matches(".exe").trim_end_matches(".cmd");
    if PROTECTED_PROCESSES.contains(&stem) || stem == "npm" || stem == "npx" {
        if has_filter {
            return Verdict::Allow;
        }
        return Verdict::deny(format!(
            "'taskkill /IM {process}' would kill the orchestrator itself. \
             Use a /FI filter to target specific processes"
        ));
    }

    if ALLOWED_KILL_TARGETS.contains(&stem) {
        return Verdict::Allow;
    }

    Verdict::deny("taskkill only allowed for dev server processes")
}

/// Init scripts: only the project's own `init.sh` (Unix) or
/// `init.bat`/`init.ps1` (Windows) may be executed.
fn validate_init_script(segment: &str, platform: Platform) -> Verdict {
    let normalized = segment.replace('\\', "/");
    let tokens = tokenize(&normalized);
    let Some(script) = tokens.first() else {
        return Verdict::deny("Empty command");
    };
    let script = script.to_lowercase();

    match platform {
        Platform::Unix => {
            if script == "./init.sh" || script.ends_with("/init.sh") {
                Verdict::Allow
            } else {
                Verdict::deny(format!("Only ./init.sh is allowed, got: {script}"))
            }
        }
        Platform::Windows => {
            for name in ["init.bat", "init.ps1"] {
                if script == name
                    || script == format!("./{name}")
                    || script.ends_with(&format!("/{name}"))
                {
                    return Verdict::Allow;
                }
            }
            if script == "powershell" {
                let lowered: Vec<String> = tokens.iter().map(|t| t.to_lowercase()).collect();
                if let Some(i) = lowered.iter().position(|t| t == "-file") {
                    if let Some(ps) = lowered.get(i + 1) {
                        if ps == "init.ps1"
                            || ps == "./init.ps1"
                            || ps.ends_with("/init.ps1")
                        {
                            return Verdict::Allow;
                        }
                    }
                }
            }
            Verdict::deny(format!(
                "Only init.bat or init.ps1 allowed on Windows, got: {script}"
            ))
        }
    }
}
