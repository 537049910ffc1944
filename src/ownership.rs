//! uid/gid 名称缓存：冷缓存单次查询，后台定期批量刷新。

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// 单个 id 的查询策略（缓存未命中时使用）。
pub trait NameLookup: Send + Sync {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// 整表加载策略（后台刷新时使用）。
pub trait NameTable: Send + Sync {
    fn load_users(&self) -> io::Result<HashMap<u32, String>>;
    fn load_groups(&self) -> io::Result<HashMap<u32, String>>;
}

/// 通过系统 NSS 接口查询单个用户或组。
pub struct SystemLookup;

#[cfg(unix)]
impl NameLookup for SystemLookup {
    fn user_name(&self, uid: u32) -> Option<String> {
        nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| user.name)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|group| group.name)
    }
}

#[cfg(not(unix))]
impl NameLookup for SystemLookup {
    fn user_name(&self, _uid: u32) -> Option<String> {
        None
    }

    fn group_name(&self, _gid: u32) -> Option<String> {
        None
    }
}

/// 解析 passwd/group 格式的文本表。
pub struct EtcFiles {
    passwd: PathBuf,
    group: PathBuf,
}

impl EtcFiles {
    pub fn new(passwd: PathBuf, group: PathBuf) -> Self {
        Self { passwd, group }
    }
}

impl NameTable for EtcFiles {
    fn load_users(&self) -> io::Result<HashMap<u32, String>> {
        Ok(parse_id_table(&std::fs::read_to_string(&self.passwd)?))
    }

    fn load_groups(&self) -> io::Result<HashMap<u32, String>> {
        Ok(parse_id_table(&std::fs::read_to_string(&self.group)?))
    }
}

/// `name:password:id:...`，passwd 与 group 的前三列格式一致。
fn parse_id_table(content: &str) -> HashMap<u32, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split(':');
            let name = fields.next()?;
            let id = fields.nth(1)?.parse::<u32>().ok()?;
            if name.is_empty() {
                return None;
            }
            Some((id, name.to_string()))
        })
        .collect()
}

pub struct OwnershipCache {
    users: RwLock<HashMap<u32, String>>,
    groups: RwLock<HashMap<u32, String>>,
    refreshed_at: RwLock<Option<DateTime<Utc>>>,
    lookup: Arc<dyn NameLookup>,
    table: Arc<dyn NameTable>,
}

impl OwnershipCache {
    pub fn new(lookup: Arc<dyn NameLookup>, table: Arc<dyn NameTable>) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            refreshed_at: RwLock::new(None),
            lookup,
            table,
        }
    }

    /// 使用系统查询与给定的 passwd/group 文件创建缓存。
    pub fn system(passwd: PathBuf, group: PathBuf) -> Self {
        Self::new(Arc::new(SystemLookup), Arc::new(EtcFiles::new(passwd, group)))
    }

    /// 返回 uid 对应的用户名；查询失败时缓存并返回数字字符串。
    pub fn username_for(&self, uid: u32) -> String {
        if let Some(name) = self.users.read().get(&uid) {
            return name.clone();
        }
        let name = self
            .lookup
            .user_name(uid)
            .unwrap_or_else(|| uid.to_string());
        self.users.write().entry(uid).or_insert(name).clone()
    }

    /// 返回 gid 对应的组名；查询失败时缓存并返回数字字符串。
    pub fn groupname_for(&self, gid: u32) -> String {
        if let Some(name) = self.groups.read().get(&gid) {
            return name.clone();
        }
        let name = self
            .lookup
            .group_name(gid)
            .unwrap_or_else(|| gid.to_string());
        self.groups.write().entry(gid).or_insert(name).clone()
    }

    /// 整表重新加载并替换；任一表加载失败时保留旧表。
    pub fn refresh(&self) -> io::Result<()> {
        let users = self.table.load_users()?;
        let groups = self.table.load_groups()?;
        debug!(
            users = users.len(),
            groups = groups.len(),
            "ownership tables reloaded"
        );
        *self.users.write() = users;
        *self.groups.write() = groups;
        *self.refreshed_at.write() = Some(Utc::now());
        Ok(())
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        *self.refreshed_at.read()
    }
}
