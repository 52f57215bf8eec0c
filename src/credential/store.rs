use crate::credential::types::Credential;
use crate::error::GatewayError;
use anyhow::{Context, anyhow};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};

/// 带版本号的凭证；版本在每次写入时单调递增，用于检测刷新期间的并发改写。
#[derive(Debug, Clone)]
pub struct VaultEntry {
    pub version: u64,
    pub credential: Credential,
}

type Slot = Arc<Mutex<Option<VaultEntry>>>;

/// 条件写入失败的原因。
#[derive(Debug, Clone)]
pub enum CasConflict {
    /// 版本已变化，携带当前条目。
    Stale(VaultEntry),
    /// 凭证已被删除。
    Gone,
}

/// 凭证保险库：同一账号的读写串行化，不同账号互不阻塞；写入后立即对所有读者可见。
#[derive(Debug)]
pub struct Vault {
    slots: RwLock<HashMap<String, Slot>>,
    next_version: AtomicU64,
    file_path: Option<PathBuf>,
    save_lock: Mutex<()>,
}

impl Vault {
    pub fn new(file_path: Option<PathBuf>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            file_path,
            save_lock: Mutex::new(()),
        }
    }

    pub async fn get(&self, account_id: &str) -> Result<VaultEntry, GatewayError> {
        let slot = self
            .slot(account_id)
            .await
            .ok_or_else(|| GatewayError::not_found(format!("账号 {account_id} 的凭证")))?;
        let guard = slot.lock().await;
        guard
            .clone()
            .ok_or_else(|| GatewayError::not_found(format!("账号 {account_id} 的凭证")))
    }

    pub async fn contains(&self, account_id: &str) -> bool {
        self.get(account_id).await.is_ok()
    }

    /// 无条件写入，返回新版本号。
    pub async fn put(&self, account_id: &str, credential: Credential) -> u64 {
        let slot = self.slot_or_insert(account_id).await;
        let mut guard = slot.lock().await;
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        *guard = Some(VaultEntry {
            version,
            credential,
        });
        version
    }

    /// 仅当当前版本等于 `expected` 时写入；否则保持原值。
    ///
    /// 刷新结果用它落库：刷新期间若有人手动更新或删除了凭证，刷新结果被丢弃。
    pub async fn put_if_version(
        &self,
        account_id: &str,
        expected: u64,
        credential: Credential,
    ) -> Result<VaultEntry, CasConflict> {
        let slot = self.slot(account_id).await.ok_or(CasConflict::Gone)?;
        let mut guard = slot.lock().await;
        match guard.as_ref() {
            None => Err(CasConflict::Gone),
            Some(cur) if cur.version != expected => Err(CasConflict::Stale(cur.clone())),
            Some(_) => {
                let entry = VaultEntry {
                    version: self.next_version.fetch_add(1, Ordering::SeqCst),
                    credential,
                };
                *guard = Some(entry.clone());
                Ok(entry)
            }
        }
    }

    pub async fn delete(&self, account_id: &str) -> bool {
        let slot = { self.slots.write().await.remove(account_id) };
        let Some(slot) = slot else {
            return false;
        };
        // 已持有旧 slot 的读者随后会看到 None。
        slot.lock().await.take().is_some()
    }

    /// 所有 OAuth 凭证应当刷新的时间点（毫秒）；过期时间未知的为 None。
    pub async fn oauth_refresh_due(&self) -> Vec<(String, Option<i64>)> {
        let slots: Vec<(String, Slot)> = {
            let map = self.slots.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut out = Vec::new();
        for (id, slot) in slots {
            let guard = slot.lock().await;
            if let Some(entry) = guard.as_ref()
                && entry.credential.is_oauth()
            {
                out.push((id, entry.credential.refresh_due_ms()));
            }
        }
        out
    }

    pub async fn load(&self) -> anyhow::Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let data = match tokio::fs::read(path).await {
            Ok(v) => v,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("读取 credentials.json 失败"),
        };
        let creds: HashMap<String, Credential> = sonic_rs::from_slice(&data)
            .map_err(|e| anyhow!(e))
            .context("解析 credentials.json 失败")?;
        for (id, c) in creds {
            self.put(&id, c).await;
        }
        Ok(())
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.file_path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;

        let slots: Vec<(String, Slot)> = {
            let map = self.slots.read().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut snapshot: HashMap<String, Credential> = HashMap::with_capacity(slots.len());
        for (id, slot) in slots {
            if let Some(entry) = slot.lock().await.as_ref() {
                snapshot.insert(id, entry.credential.clone());
            }
        }

        ensure_parent_dir(path).await?;
        let data = sonic_rs::to_vec_pretty(&snapshot).context("序列化 credentials.json 失败")?;
        tokio::fs::write(path, data)
            .await
            .context("写入 credentials.json 失败")
    }

    async fn slot(&self, account_id: &str) -> Option<Slot> {
        self.slots.read().await.get(account_id).cloned()
    }

    async fn slot_or_insert(&self, account_id: &str) -> Slot {
        if let Some(slot) = self.slot(account_id).await {
            return slot;
        }
        let mut map = self.slots.write().await;
        map.entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }
}

async fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .context("创建数据目录失败")
}
