use std::net::IpAddr;

use crate::ast::AclDecl;

#[derive(Clone, Debug)]
pub struct Acl {
    pub name: String,
    pub entries: Vec<AclEntry>,
}

#[derive(Clone, Debug)]
pub struct AclEntry {
    pub negated: bool,
    pub network: IpAddr,
    pub prefix: u8,
}

impl Acl {
    pub fn from_decl(decl: &AclDecl) -> Result<Self, String> {
        let mut entries = Vec::with_capacity(decl.entries.len());
        for entry in &decl.entries {
            let network: IpAddr = entry.ip.parse().map_err(|_| {
                format!("invalid IP address '{}' in acl {}", entry.ip, decl.name.name)
            })?;
            let max = if network.is_ipv4() { 32 } else { 128 };
            let prefix = entry.mask.unwrap_or(max);
            if prefix > max {
                return Err(format!(
                    "invalid mask /{prefix} for '{}' in acl {}",
                    entry.ip, decl.name.name
                ));
            }
            entries.push(AclEntry {
                negated: entry.negated,
                network,
                prefix,
            });
        }
        Ok(Self {
            name: decl.name.name.clone(),
            entries,
        })
    }

    /// Member iff a positive entry covers `ip` and no negated entry does.
    pub fn matches(&self, ip: IpAddr) -> bool {
        let mut matched = false;
        for entry in &self.entries {
            if !entry.contains(ip) {
                continue;
            }
            if entry.negated {
                return false;
            }
            matched = true;
        }
        matched
    }
}

impl AclEntry {
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                prefix_eq(&net.octets(), &ip.octets(), self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                prefix_eq(&net.octets(), &ip.octets(), self.prefix)
            }
            (IpAddr::V6(net), IpAddr::V4(ip)) => net
                .to_ipv4_mapped()
                .is_some_and(|mapped| {
                    prefix_eq(&mapped.octets(), &ip.octets(), self.prefix.saturating_sub(96))
                }),
            (IpAddr::V4(_), IpAddr::V6(ip)) => ip
                .to_ipv4_mapped()
                .is_some_and(|mapped| self.contains(IpAddr::V4(mapped))),
        }
    }
}

fn prefix_eq(a: &[u8], b: &[u8], prefix: u8) -> bool {
    let full = (prefix / 8) as usize;
    if a[..full] != b[..full] {
        return false;
    }
    let rest = prefix % 8;
    if rest == 0 {
        return true;
    }
    let mask = 0xffu8 << (8 - rest);
    (a[full] & mask) == (b[full] & mask)
}
