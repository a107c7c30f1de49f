//! Boot-time unlock script for cryptsetup volumes.
//!
//! Each volume gets a bounded retry loop. Every pass resolves the source
//! device, optionally runs the key command into `/run/vars/key_data`, then
//! tries the open methods in order until one succeeds:
//!
//! ```text
//! key data ─> splash prompt ─> key file | bare prompt
//! ```
//!
//! After the loop, a volume with keys and `try_nokey` gets a second loop with
//! every key parameter stripped. A volume still closed after that is fatal.

use tracing::{debug, warn};

use super::volume::CryptsetupVolume;
use crate::context::BuildContext;
use crate::error::Result;
use crate::shell::{Dq, Line, Script, Stmt};

const KEY_DATA: &str = "/run/vars/key_data";

/// Global settings that shape every volume's script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockOptions {
    /// Ask for confirmation once before the loop.
    pub prompt: bool,
    /// Retry without confirmation after a failed attempt.
    pub autoretry: bool,
    /// Plymouth is loaded.
    pub splash: bool,
    /// Pass `--allow-discards`.
    pub trim: bool,
    pub default_retries: u64,
}

impl Default for UnlockOptions {
    fn default() -> Self {
        Self {
            prompt: false,
            autoretry: true,
            splash: false,
            trim: false,
            default_retries: 5,
        }
    }
}

impl UnlockOptions {
    pub fn from_context(ctx: &BuildContext) -> Self {
        let config = &ctx.config;
        Self {
            prompt: config.get_bool("cryptsetup_prompt"),
            autoretry: config.get_bool("cryptsetup_autoretry"),
            splash: ctx.has_module("plymouth"),
            trim: config.get_bool("cryptsetup_trim"),
            default_retries: config.get_u64("cryptsetup_retries").unwrap_or(5),
        }
    }
}

/// One way of opening the device, in order of preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt {
    /// Key material produced by the key command.
    KeyData,
    /// Passphrase asked for by the splash, which runs cryptsetup itself.
    Splash,
    /// Key file read directly by cryptsetup.
    KeyFile(String),
    /// Passphrase asked for on the console.
    Interactive,
}

/// Unlock script for one volume.
#[derive(Debug, Clone)]
pub struct UnlockPlan<'a> {
    pub name: &'a str,
    pub volume: CryptsetupVolume,
    pub options: UnlockOptions,
}

impl<'a> UnlockPlan<'a> {
    pub fn new(name: &'a str, volume: CryptsetupVolume, options: UnlockOptions) -> Self {
        Self { name, volume, options }
    }

    pub fn retries(&self) -> u64 {
        self.volume
            .retries
            .filter(|r| *r > 0)
            .unwrap_or(self.options.default_retries)
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        let mut attempts = Vec::new();
        if self.volume.key_command.is_some() {
            attempts.push(Attempt::KeyData);
        }
        if self.options.splash {
            attempts.push(Attempt::Splash);
        }
        match &self.volume.key_file {
            Some(key_file) => attempts.push(Attempt::KeyFile(key_file.clone())),
            None => attempts.push(Attempt::Interactive),
        }
        attempts
    }

    /// The keyless retry, when the volume asks for one and has keys to strip.
    pub fn fallback(&self) -> Option<UnlockPlan<'a>> {
        let has_keys = self.volume.key_file.is_some() || self.volume.key_command.is_some();
        (self.volume.try_nokey && has_keys).then(|| UnlockPlan::new(self.name, self.volume.without_keys(), self.options))
    }

    /// `cryptsetup open` with the volume's options, up to the key argument.
    fn open_command(&self) -> Line {
        let mut line = Line::cmd("cryptsetup open --tries 1");
        if let Some(header_file) = &self.volume.header_file {
            line = line.raw("--header").lit(header_file.as_str());
        }
        if self.options.trim {
            line = line.raw("--allow-discards");
        }
        line
    }

    fn open_with(&self, key: Option<Line>) -> Line {
        let mut line = self.open_command();
        if let Some(key) = key {
            line = line.then(key);
        }
        line.dq(Dq::new().var("crypt_dev")).raw(self.name)
    }

    fn progress(&self, text: &str) -> Dq {
        Dq::new()
            .text("[")
            .var("i")
            .text(format!(" / {}] {}", self.retries(), text))
    }

    fn key_failure(&self) -> Vec<Stmt> {
        let mut body: Vec<Stmt> = vec![
            Line::cmd("rm -f").raw(KEY_DATA).into(),
            Line::cmd("ewarn")
                .dq(Dq::new()
                    .text(format!("Failed to run key command for: {} (", self.name))
                    .var("i")
                    .text(format!(" / {})", self.retries())))
                .into(),
        ];
        if let Some(reset) = &self.volume.reset_command {
            body.push(Stmt::Raw(reset.clone()));
        }
        body.push(Stmt::Raw("continue".into()));
        body
    }

    fn key_acquisition(&self) -> Vec<Stmt> {
        let Some(key_command) = &self.volume.key_command else {
            return Vec::new();
        };
        let what = self.volume.key_file.as_deref().unwrap_or(key_command);
        let mut out: Vec<Stmt> = vec![
            Line::cmd("einfo").lit(format!("Attempting to open LUKS key: {}", what)).into(),
            Line::cmd("edebug").lit(format!("Using key command: {}", key_command)).into(),
        ];
        let direct = Line::cmd(format!("! {} > {}", key_command, KEY_DATA));

        match (&self.volume.plymouth_key_command, self.options.splash) {
            (Some(plymouth_command), true) => {
                let ask = Line::cmd("! plymouth ask-for-password --prompt")
                    .dq(self.progress(&format!("Enter passphrase to unlock key for: {}", self.name)))
                    .raw("--command")
                    .lit(plymouth_command.as_str())
                    .raw(format!("--number-of-tries 1 > {}", KEY_DATA));
                out.push(Stmt::If {
                    branches: vec![
                        (Line::cmd("plymouth --ping"), vec![Stmt::if_then(ask, self.key_failure())]),
                        (direct, self.key_failure()),
                    ],
                    otherwise: None,
                });
            }
            _ => out.push(Stmt::if_then(direct, self.key_failure())),
        }
        out
    }

    fn open_branches(&self) -> Vec<(Line, Vec<Stmt>)> {
        let brk = || Stmt::Raw("break".into());
        self.attempts()
            .into_iter()
            .map(|attempt| match attempt {
                Attempt::KeyData => {
                    let open = self.open_with(Some(Line::cmd(format!("--key-file={}", KEY_DATA))));
                    let rm = Stmt::from(Line::cmd("rm -f").raw(KEY_DATA));
                    (
                        Line::cmd(format!("[ -e {} ]", KEY_DATA)),
                        vec![Stmt::if_then(open, vec![rm.clone(), brk()]), rm],
                    )
                }
                Attempt::Splash => {
                    let command = self.open_command().render();
                    let cond = Line::cmd("plymouth --ping && plymouth ask-for-password --prompt")
                        .dq(self.progress(&format!("Enter passphrase to unlock {}", self.name)))
                        .raw("--command")
                        .dq(Dq::new()
                            .text(format!("{} ", command))
                            .var("crypt_dev")
                            .text(format!(" {}", self.name)))
                        .raw("--number-of-tries 1");
                    (cond, vec![brk()])
                }
                Attempt::KeyFile(key_file) => {
                    let open = self.open_with(Some(Line::cmd("--key-file").lit(key_file)));
                    (open, vec![brk()])
                }
                Attempt::Interactive => (self.open_with(None), vec![brk()]),
            })
            .collect()
    }

    /// The retry loop, preceded by the optional confirmation prompt.
    pub fn render(&self) -> Vec<Stmt> {
        debug!("[{}] Processing cryptsetup volume: {:?}", self.name, self.volume);
        let retries = self.retries();
        let mut out: Vec<Stmt> = Vec::new();
        if self.options.prompt {
            out.push(Line::cmd("prompt_user").lit(format!("Press enter to unlock device: {}", self.name)).into());
        }

        let mut body: Vec<Stmt> = vec![
            Line::assign("crypt_dev", Dq::new().sub(format!("get_crypt_dev {}", self.name))).into(),
            Stmt::if_then(
                Line::cmd("[ -z").dq(Dq::new().var("crypt_dev")).raw("]"),
                vec![Line::cmd("rd_fail")
                    .lit(format!("Failed to resolve device source for cryptsetup mount: {}", self.name))
                    .into()],
            ),
        ];
        body.extend(self.key_acquisition());
        if let Some(header_file) = &self.volume.header_file {
            body.push(Line::cmd("einfo").lit(format!("Using header file: {}", header_file)).into());
        }
        if self.options.trim {
            warn!("[{}] Using --allow-discards can be a security risk.", self.name);
        }
        body.push(
            Line::cmd("einfo")
                .dq(Dq::new().text("Unlocking device: ").var("crypt_dev"))
                .into(),
        );
        body.push(Stmt::If {
            branches: self.open_branches(),
            otherwise: None,
        });
        body.push(
            Line::cmd("ewarn")
                .dq(Dq::new()
                    .text(format!("Failed to open device: {} (", self.name))
                    .var("i")
                    .text(format!(" / {})", retries)))
                .into(),
        );
        if !self.options.autoretry {
            body.push(Line::cmd("prompt_user").dq("Press enter to retry").into());
        }
        if let Some(reset) = &self.volume.reset_command {
            body.push(Line::cmd("einfo").dq("Running key reset command").into());
            body.push(Stmt::Raw(reset.clone()));
        }

        out.push(Stmt::Loop {
            var: "i".into(),
            count: retries,
            body,
        });
        out
    }
}

fn status(name: &str) -> Line {
    Line::cmd(format!("cryptsetup status {} > /dev/null 2>&1", name))
}

fn not_open(name: &str) -> Line {
    Line::cmd(format!("! cryptsetup status {} > /dev/null 2>&1", name))
}

/// Full unlock sequence for one volume.
pub fn unlock_volume(name: &str, volume: CryptsetupVolume, options: UnlockOptions) -> Vec<Stmt> {
    let plan = UnlockPlan::new(name, volume, options);
    let mut attempt = plan.render();
    if let Some(fallback) = plan.fallback() {
        let mut body: Vec<Stmt> =
            vec![Line::cmd("ewarn").dq(format!("Failed to open device using keys: {}", name).as_str()).into()];
        body.extend(fallback.render());
        attempt.push(Stmt::if_then(not_open(name), body));
    }

    vec![
        Stmt::If {
            branches: vec![(
                status(name),
                vec![Line::cmd("ewarn").dq(format!("Device already open: {}", name).as_str()).into()],
            )],
            otherwise: Some(attempt),
        },
        Stmt::if_then(
            not_open(name),
            vec![Line::cmd("rd_fail")
                .dq(format!("Failed to open cryptsetup device: {}", name).as_str())
                .into()],
        ),
        Line::cmd("einfo")
            .dq(format!("Successfully opened cryptsetup device: {}", name).as_str())
            .into(),
    ]
}

/// Unlock every configured volume, in declaration order.
pub fn crypt_init(ctx: &mut BuildContext) -> Result<Script> {
    if ctx.config.get_u64("loglevel").unwrap_or(5) > 5 {
        warn!("loglevel > 5, cryptsetup prompts may not be visible.");
    }
    let options = UnlockOptions::from_context(ctx);
    let mut script = Script::line(
        Line::cmd("einfo").dq(format!("Unlocking LUKS volumes, rdgen version: {}", crate::VERSION).as_str()),
    );
    for (name, volume) in super::validate::volumes(ctx)? {
        for stmt in unlock_volume(&name, volume, options) {
            script.push(stmt);
        }
    }
    Ok(script)
}

/// Resolve a volume's source device at boot: the exported path if it exists,
/// otherwise a blkid token lookup.
pub fn get_crypt_dev(_: &mut BuildContext) -> Result<Script> {
    Ok(Script::raw(
        r#"
        source_dev="$(readvar CRYPTSETUP_SOURCE_"$1")"
        source_token="$(readvar CRYPTSETUP_TOKEN_"$1")"
        if [ -n "$source_dev" ]; then
            if [ -e "$source_dev" ]; then
                printf '%s' "$source_dev"
                return
            fi
        fi
        if [ -n "$source_token" ]; then
            source_dev=$(blkid --match-token "$source_token" --output device)
            if [ -n "$source_dev" ]; then
                printf '%s' "$source_dev"
            fi
        fi
        "#,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn volume(json: serde_json::Value) -> CryptsetupVolume {
        CryptsetupVolume::from_value("root", &json).unwrap()
    }

    fn render(name: &str, volume: CryptsetupVolume, options: UnlockOptions) -> String {
        Script::from(unlock_volume(name, volume, options)).render()
    }

    #[test]
    fn test_loop_bound_is_retries() {
        let text = render("root", volume(serde_json::json!({"uuid": "u", "retries": 3})), UnlockOptions::default());
        assert!(text.contains(r#"while [ "$((i += 1))" -le 3 ]; do"#), "{}", text);

        let text = render("root", volume(serde_json::json!({"uuid": "u"})), UnlockOptions::default());
        assert!(text.contains("-le 5 ]"), "{}", text);
    }

    #[test]
    fn test_key_file_only() {
        let v = volume(serde_json::json!({"uuid": "u", "key_file": "/etc/root.key", "retries": 5}));
        let plan = UnlockPlan::new("root", v.clone(), UnlockOptions::default());
        assert_eq!(plan.attempts(), vec![Attempt::KeyFile("/etc/root.key".into())]);
        assert!(plan.fallback().is_none());

        let text = render("root", v, UnlockOptions::default());
        assert_eq!(text.matches("cryptsetup open").count(), 1, "{}", text);
        assert_eq!(text.matches("while [").count(), 1);
        assert!(text.contains(r#"if cryptsetup open --tries 1 --key-file '/etc/root.key' "${crypt_dev}" root; then"#));
        assert!(!text.contains("using keys"));
    }

    #[test]
    fn test_try_nokey_adds_fallback_loop() {
        let v = volume(serde_json::json!({"uuid": "u", "key_file": "/k", "try_nokey": true}));
        let text = render("root", v, UnlockOptions::default());
        assert_eq!(text.matches("while [").count(), 2, "{}", text);
        let keyed = text.find("--key-file '/k'").unwrap();
        let fallback = text.find("Failed to open device using keys: root").unwrap();
        assert!(keyed < fallback);
        assert!(text[fallback..].contains(r#"elif cryptsetup open --tries 1 "${crypt_dev}" root"#)
            || text[fallback..].contains(r#"if cryptsetup open --tries 1 "${crypt_dev}" root"#));
        assert!(!text[fallback..].contains("--key-file"));
    }

    #[test]
    fn test_try_nokey_without_keys_has_no_fallback() {
        let v = volume(serde_json::json!({"uuid": "u", "try_nokey": true}));
        let text = render("root", v, UnlockOptions::default());
        assert_eq!(text.matches("while [").count(), 1);
    }

    #[test]
    fn test_key_command_attempt_order() {
        let v = volume(serde_json::json!({
            "uuid": "u",
            "key_file": "/boot/root.gpg",
            "key_command": "gpg --decrypt /boot/root.gpg",
            "plymouth_key_command": "gpg --passphrase-fd 0 --decrypt /boot/root.gpg",
            "reset_command": "gpgconf --reload"
        }));
        let options = UnlockOptions {
            splash: true,
            ..Default::default()
        };
        let plan = UnlockPlan::new("root", v.clone(), options);
        assert_eq!(
            plan.attempts(),
            vec![Attempt::KeyData, Attempt::Splash, Attempt::KeyFile("/boot/root.gpg".into())]
        );

        let text = render("root", v, options);
        let key_data = text.find("if [ -e /run/vars/key_data ]; then").unwrap();
        let splash = text.find("elif plymouth --ping && plymouth ask-for-password").unwrap();
        let key_file = text.find("elif cryptsetup open --tries 1 --key-file '/boot/root.gpg'").unwrap();
        assert!(key_data < splash && splash < key_file, "{}", text);
        assert!(text.contains("if ! gpg --decrypt /boot/root.gpg > /run/vars/key_data; then"));
        assert!(text.contains("--command 'gpg --passphrase-fd 0 --decrypt /boot/root.gpg'"));
        assert!(text.contains("gpgconf --reload\n"));
    }

    #[test]
    fn test_key_data_removed_on_both_paths() {
        let v = volume(serde_json::json!({"uuid": "u", "key_command": "cat /k"}));
        let lines = Script::from(unlock_volume("root", v, UnlockOptions::default())).lines();
        let start = lines.iter().position(|l| l.contains("[ -e /run/vars/key_data ]")).unwrap();
        let block: Vec<&str> = lines[start..start + 6].iter().map(|l| l.trim()).collect();
        assert_eq!(
            block,
            vec![
                "if [ -e /run/vars/key_data ]; then",
                r#"if cryptsetup open --tries 1 --key-file=/run/vars/key_data "${crypt_dev}" root; then"#,
                "rm -f /run/vars/key_data",
                "break",
                "fi",
                "rm -f /run/vars/key_data",
            ]
        );
    }

    #[test]
    fn test_header_and_discards() {
        let v = volume(serde_json::json!({"partuuid": "p", "header_file": "/boot/root.hdr"}));
        let options = UnlockOptions {
            trim: true,
            ..Default::default()
        };
        let text = render("root", v, options);
        assert!(text.contains("cryptsetup open --tries 1 --header '/boot/root.hdr' --allow-discards \"${crypt_dev}\" root"));
        assert!(text.contains("einfo 'Using header file: /boot/root.hdr'"));
    }

    #[test]
    fn test_prompt_and_manual_retry() {
        let options = UnlockOptions {
            prompt: true,
            autoretry: false,
            ..Default::default()
        };
        let text = render("root", volume(serde_json::json!({"uuid": "u"})), options);
        let prompt = text.find("prompt_user 'Press enter to unlock device: root'").unwrap();
        assert!(prompt < text.find("while [").unwrap());
        assert!(text.contains(r#"prompt_user "Press enter to retry""#));
    }

    #[test]
    fn test_already_open_and_terminal_failure() {
        let text = render("root", volume(serde_json::json!({"uuid": "u"})), UnlockOptions::default());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "if cryptsetup status root > /dev/null 2>&1; then");
        assert_eq!(lines[1], r#"    ewarn "Device already open: root""#);
        assert_eq!(lines[2], "else");
        assert!(text.contains("if ! cryptsetup status root > /dev/null 2>&1; then\n    rd_fail \"Failed to open cryptsetup device: root\"\nfi"));
        assert!(text.ends_with(r#"einfo "Successfully opened cryptsetup device: root""#));
    }
}
