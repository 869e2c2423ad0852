//! Who the console's shell runs as.

use regex::Regex;
use std::sync::LazyLock;

use crate::error::ConsoleError;

static UID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\buid=(\d+)").expect("valid regex"));
static GID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bgid=(\d+)").expect("valid regex"));
static GROUPS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bgroups=(\S+)").expect("valid regex"));
static GROUP_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Identity {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Parse the output of `id`, e.g. `uid=0(root) gid=0(root) groups=0(root),3(sys)`.
    pub fn parse(output: &str) -> Result<Self, ConsoleError> {
        let number = |re: &Regex, what: &str| -> Result<u32, ConsoleError> {
            re.captures(output)
                .and_then(|c| c[1].parse().ok())
                .ok_or_else(|| {
                    ConsoleError::Execution(format!("no {what} in id output: {}", output.trim()))
                })
        };
        let uid = number(&UID_RE, "uid")?;
        let gid = number(&GID_RE, "gid")?;
        let groups = GROUPS_RE
            .captures(output)
            .map(|c| {
                c[1].split(',')
                    .filter_map(|g| GROUP_ID_RE.captures(g).and_then(|m| m[1].parse().ok()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self { uid, gid, groups })
    }
}

/// Parse the output of `id -G`: whitespace separated numeric group ids.
pub fn parse_group_ids(output: &str) -> Result<Vec<u32>, ConsoleError> {
    output
        .split_whitespace()
        .map(|g| {
            g.parse()
                .map_err(|_| ConsoleError::Execution(format!("invalid group id: {g}")))
        })
        .collect()
}
