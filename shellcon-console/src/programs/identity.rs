use crate::error::ConsoleError;
use crate::identity::{Identity, parse_group_ids};
use crate::program::{Program, SyncResultProgram};

/// Runs `id` and parses uid, gid and groups.
#[derive(Debug, Default)]
pub struct IdentityProgram {
    identity: Option<Identity>,
}

impl IdentityProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_identity(self) -> Option<Identity> {
        self.identity
    }
}

impl Program for IdentityProgram {
    fn id(&self) -> &str {
        "id"
    }

    fn command(&self) -> &str {
        "id"
    }

    fn arguments(&self) -> String {
        String::new()
    }
}

impl SyncResultProgram for IdentityProgram {
    fn parse(&mut self, stdout: &str, _stderr: &str) -> Result<(), ConsoleError> {
        self.identity = Some(Identity::parse(stdout)?);
        Ok(())
    }
}

/// Runs `id -G` for numeric group ids.
#[derive(Debug, Default)]
pub struct GroupsProgram {
    groups: Vec<u32>,
}

impl GroupsProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_groups(self) -> Vec<u32> {
        self.groups
    }
}

impl Program for GroupsProgram {
    fn id(&self) -> &str {
        "groups"
    }

    fn command(&self) -> &str {
        "id"
    }

    fn arguments(&self) -> String {
        "-G".to_string()
    }
}

impl SyncResultProgram for GroupsProgram {
    fn parse(&mut self, stdout: &str, _stderr: &str) -> Result<(), ConsoleError> {
        self.groups = parse_group_ids(stdout)?;
        Ok(())
    }
}
