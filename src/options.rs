//! Composed, case-insensitive OpenSSH-style connection options.
//!
//! Ported from RadSSH's `sshconfig.py`: a priority chain of layers —
//! connection-spec overrides, command-line, package config, user
//! `ssh_config`, system `ssh_config`, built-in defaults, highest priority
//! last-in-wins — composed into one effective map. Two option families get
//! special treatment while composing:
//!
//! - **Cumulative list options** (`identityfile`, `certificatefile`) merge
//!   across *every* layer rather than being shadowed, since OpenSSH itself
//!   treats repeated `IdentityFile` directives as additive.
//! - **List-valued string options** (`ciphers`, `macs`, `kexalgorithms`,
//!   `hostkeyalgorithms`, `pubkeyacceptedkeytypes`, `hostbasedkeytypes`)
//!   honor a leading `+`/`-`/`^` on a layer's value to append, remove-by-
//!   pattern, or prepend relative to the value resolved from lower layers,
//!   instead of replacing it outright.

use std::collections::HashMap;

use wildmatch::WildMatch;

/// Option names whose values accumulate across every layer instead of being shadowed.
pub const CUMULATIVE_OPTIONS: &[&str] = &["identityfile", "certificatefile"];

/// Option names whose comma-separated values honor `+`/`-`/`^` prefixes.
pub const LIST_OPTIONS: &[&str] = &[
    "ciphers",
    "macs",
    "kexalgorithms",
    "hostkeyalgorithms",
    "pubkeyacceptedkeytypes",
    "hostbasedkeytypes",
];

/// One priority layer in the chain: a label (for diagnostics) plus its raw,
/// case-insensitively-keyed option values.
#[derive(Debug, Clone)]
pub struct OptionLayer {
    /// Human-readable source of this layer, e.g. `"command-line"`, `"defaults"`.
    pub label: String,
    values: HashMap<String, String>,
}

impl OptionLayer {
    /// Build a layer from an iterator of `(key, value)` pairs; keys are lowercased.
    pub fn new(label: impl Into<String>, values: impl IntoIterator<Item = (String, String)>) -> Self {
        OptionLayer {
            label: label.into(),
            values: values
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
        }
    }
}

/// An ordered chain of [`OptionLayer`]s, lowest priority first.
#[derive(Debug, Clone, Default)]
pub struct SshOptions {
    layers: Vec<OptionLayer>,
}

impl SshOptions {
    /// Start an empty chain; push layers lowest-priority first with [`SshOptions::push_layer`].
    pub fn new() -> Self {
        SshOptions { layers: Vec::new() }
    }

    /// Append a layer; later pushes take priority over earlier ones.
    pub fn push_layer(&mut self, layer: OptionLayer) -> &mut Self {
        self.layers.push(layer);
        self
    }

    /// Compose the chain into one effective `key -> value` map.
    pub fn compose(&self) -> HashMap<String, String> {
        let mut resolved: HashMap<String, String> = HashMap::new();
        let mut cumulative: HashMap<String, Vec<String>> = HashMap::new();

        for layer in &self.layers {
            for (key, value) in &layer.values {
                if CUMULATIVE_OPTIONS.contains(&key.as_str()) {
                    let entries = cumulative.entry(key.clone()).or_default();
                    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        entries.push(item.to_string());
                    }
                    continue;
                }
                if LIST_OPTIONS.contains(&key.as_str()) {
                    let base = resolved.get(key).cloned().unwrap_or_default();
                    let applied = apply_list_prefix(&base, value);
                    resolved.insert(key.clone(), applied);
                    continue;
                }
                // Plain option: last (highest-priority) layer defining it wins outright.
                resolved.insert(key.clone(), value.clone());
            }
        }

        for (key, items) in cumulative {
            resolved.insert(key, items.join(","));
        }
        resolved
    }
}

/// Apply a higher layer's possibly-prefixed `value` to a lower layer's resolved `base`.
fn apply_list_prefix(base: &str, value: &str) -> String {
    if let Some(rest) = value.strip_prefix('+') {
        let mut tokens = split_tokens(base);
        for t in split_tokens(rest) {
            if !tokens.contains(&t) {
                tokens.push(t);
            }
        }
        tokens.join(",")
    } else if let Some(rest) = value.strip_prefix('-') {
        let patterns: Vec<String> = split_tokens(rest);
        split_tokens(base)
            .into_iter()
            .filter(|tok| !patterns.iter().any(|p| WildMatch::new(p).matches(tok)))
            .collect::<Vec<_>>()
            .join(",")
    } else if let Some(rest) = value.strip_prefix('^') {
        let promote: Vec<String> = split_tokens(rest);
        let mut front = Vec::new();
        let mut back = Vec::new();
        for tok in split_tokens(base) {
            if promote.iter().any(|p| WildMatch::new(p).matches(&tok)) {
                if !front.contains(&tok) {
                    front.push(tok);
                }
            } else {
                back.push(tok);
            }
        }
        for tok in promote {
            if !front.contains(&tok) {
                front.push(tok);
            }
        }
        front.extend(back);
        front.join(",")
    } else {
        // Outright replace: no prefix means this layer fully overrides the list.
        value.to_string()
    }
}

fn split_tokens(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Built-in default option values, lowest-priority layer in every chain.
/// Mirrors the relevant subset of OpenSSH + package defaults (see
/// `config::defaults` for the numeric/duration ambient settings).
pub fn builtin_defaults() -> OptionLayer {
    let username = std::env::var("SSH_USER")
        .or_else(|_| std::env::var("USER"))
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "default".to_string());
    OptionLayer::new(
        "defaults",
        [
            ("port".to_string(), "22".to_string()),
            ("user".to_string(), username),
            ("pubkeyauthentication".to_string(), "yes".to_string()),
            ("passwordauthentication".to_string(), "yes".to_string()),
            ("kbdinteractiveauthentication".to_string(), "yes".to_string()),
            ("batchmode".to_string(), "no".to_string()),
            ("numberofpasswordprompts".to_string(), "3".to_string()),
            ("identitiesonly".to_string(), "no".to_string()),
            ("connecttimeout".to_string(), "30".to_string()),
            (
                "preferredauthentications".to_string(),
                "publickey,keyboard-interactive,password".to_string(),
            ),
            (
                "globalknownhostsfile".to_string(),
                "/etc/ssh/ssh_known_hosts".to_string(),
            ),
            (
                "userknownhostsfile".to_string(),
                "~/.ssh/known_hosts".to_string(),
            ),
            ("stricthostkeychecking".to_string(), "ask".to_string()),
            ("checkhostip".to_string(), "no".to_string()),
            ("hashknownhosts".to_string(), "no".to_string()),
            ("hostkeyalgorithms".to_string(), "DEFAULT".to_string()),
            ("ciphers".to_string(), "DEFAULT".to_string()),
            ("macs".to_string(), "DEFAULT".to_string()),
            ("kexalgorithms".to_string(), "DEFAULT".to_string()),
            ("pubkeyacceptedkeytypes".to_string(), "DEFAULT".to_string()),
            ("loglevel".to_string(), "ERROR".to_string()),
        ]
        .into_iter(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_layer_shadows_lower() {
        let mut opts = SshOptions::new();
        opts.push_layer(OptionLayer::new(
            "defaults",
            [("proxycommand".to_string(), "default /bin/echo".to_string())],
        ));
        opts.push_layer(OptionLayer::new(
            "radssh-config",
            [("proxycommand".to_string(), "rad /bin/echo".to_string())],
        ));
        opts.push_layer(OptionLayer::new(
            "command-line",
            [("proxycommand".to_string(), "cmd /bin/echo".to_string())],
        ));
        let composed = opts.compose();
        assert_eq!(composed.get("proxycommand").unwrap(), "cmd /bin/echo");
    }

    #[test]
    fn s2_chain_composition_scenario() {
        let mut opts = SshOptions::new();
        opts.push_layer(OptionLayer::new(
            "defaults",
            [
                ("hostkeyalgorithms".to_string(), "DEFAULT".to_string()),
                ("pubkeyacceptedkeytypes".to_string(), "rsa,ecdsa-sha2-nistp256,ed25519".to_string()),
            ],
        ));
        opts.push_layer(OptionLayer::new(
            "radssh-config",
            [(
                "hostkeyalgorithms".to_string(),
                "+foo,bar,baz".to_string(),
            )],
        ));
        opts.push_layer(OptionLayer::new(
            "command-line",
            [(
                "pubkeyacceptedkeytypes".to_string(),
                "-ecdsa*".to_string(),
            )],
        ));
        let composed = opts.compose();
        assert_eq!(
            composed.get("hostkeyalgorithms").unwrap(),
            "DEFAULT,foo,bar,baz"
        );
        assert_eq!(composed.get("pubkeyacceptedkeytypes").unwrap(), "rsa,ed25519");
    }

    #[test]
    fn cumulative_identityfile_merges_across_all_layers() {
        let mut opts = SshOptions::new();
        opts.push_layer(OptionLayer::new(
            "defaults",
            [("identityfile".to_string(), "~/.ssh/id_rsa".to_string())],
        ));
        opts.push_layer(OptionLayer::new(
            "user-config",
            [("identityfile".to_string(), "~/.ssh/id_ed25519".to_string())],
        ));
        let composed = opts.compose();
        assert_eq!(
            composed.get("identityfile").unwrap(),
            "~/.ssh/id_rsa,~/.ssh/id_ed25519"
        );
    }

    #[test]
    fn removing_at_one_layer_does_not_affect_higher_layer_resolution_order() {
        let mut opts = SshOptions::new();
        opts.push_layer(OptionLayer::new(
            "defaults",
            [("ciphers".to_string(), "aes128-ctr,aes256-ctr,3des-cbc".to_string())],
        ));
        opts.push_layer(OptionLayer::new(
            "radssh-config",
            [("ciphers".to_string(), "-3des*".to_string())],
        ));
        opts.push_layer(OptionLayer::new(
            "command-line",
            [("ciphers".to_string(), "+chacha20-poly1305".to_string())],
        ));
        let composed = opts.compose();
        assert_eq!(
            composed.get("ciphers").unwrap(),
            "aes128-ctr,aes256-ctr,chacha20-poly1305"
        );
    }
}
