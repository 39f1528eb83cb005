//! Recipe Store：进程内共享、有界 LRU、并发安全
//!
//! 读（get_candidates / get / touch）只取读锁，互不阻塞；写（put / 淘汰）取写锁，
//! 临界区只保护索引结构，不触及 Recipe 内部。最近使用序号由店内逻辑时钟分配，
//! 淘汰时取序号最小者。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::api::CacheKey;

use super::naming::deduplicate_tool_name;
use super::similarity::normalize_question;
use super::{Recipe, RecipeMeta};

/// put 的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub id: String,
    /// 最终工具名（可能带 _2 等后缀）
    pub name: String,
    /// 替换了同一问题的旧 recipe（沿用其 id）
    pub replaced: bool,
    /// 已存在结构相同的模板，未插入
    pub skipped: bool,
    /// 因超出容量被淘汰的 recipe id
    pub evicted: Option<String>,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<String, Arc<Recipe>>,
    by_key: HashMap<CacheKey, Vec<String>>,
}

impl StoreInner {
    fn under(&self, key: &CacheKey) -> impl Iterator<Item = &Arc<Recipe>> {
        self.by_key
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(|id| self.records.get(id))
    }

    fn remove(&mut self, id: &str) -> Option<Arc<Recipe>> {
        let rec = self.records.remove(id)?;
        if let Some(ids) = self.by_key.get_mut(rec.cache_key()) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_key.remove(rec.cache_key());
            }
        }
        Some(rec)
    }
}

/// 由组合根显式构造并以 Arc 共享
pub struct RecipeStore {
    inner: RwLock<StoreInner>,
    capacity: usize,
    clock: AtomicU64,
    revision: AtomicU64,
}

impl RecipeStore {
    /// 容量至少为 1
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
            revision: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 存入已校验的 recipe
    ///
    /// - 同一 CacheKey 下已有结构相同的模板：跳过，返回已有 id；
    /// - 同一 CacheKey 下已有相同问题（忽略大小写与空白）：原地替换，沿用 id 并刷新最近使用；
    /// - 否则插入，超出容量时淘汰恰好一个最久未使用的条目。
    pub fn put(&self, recipe: Recipe) -> PutOutcome {
        let mut recipe = recipe;
        let key = recipe.cache_key().clone();
        let question_sig = normalize_question(recipe.question());

        let mut inner = self.write();

        if let Some(existing) = inner.under(&key).find(|r| r.template() == recipe.template()) {
            tracing::debug!(recipe_id = %existing.id(), "identical recipe template already cached");
            return PutOutcome {
                id: existing.id().to_string(),
                name: existing.name().to_string(),
                replaced: false,
                skipped: true,
                evicted: None,
            };
        }

        let previous = inner
            .under(&key)
            .find(|r| normalize_question(r.question()) == question_sig)
            .cloned();
        if let Some(prev) = &previous {
            recipe.inherit_from(prev);
            inner.remove(prev.id());
        }

        let taken: Vec<String> = inner.under(&key).map(|r| r.name().to_string()).collect();
        let name = deduplicate_tool_name(recipe.name(), taken.iter().map(String::as_str));
        let recipe = recipe.with_name(name);
        recipe.set_recency(self.tick());

        let id = recipe.id().to_string();
        let name = recipe.name().to_string();
        inner.records.insert(id.clone(), Arc::new(recipe));
        inner.by_key.entry(key.clone()).or_default().push(id.clone());

        let evicted = if inner.records.len() > self.capacity {
            let oldest = inner
                .records
                .values()
                .filter(|r| r.id() != id)
                .min_by_key(|r| r.recency())
                .map(|r| r.id().to_string());
            oldest.and_then(|old| inner.remove(&old)).map(|r| r.id().to_string())
        } else {
            None
        };
        let size = inner.records.len();
        drop(inner);

        self.revision.fetch_add(1, Ordering::AcqRel);
        let replaced = previous.is_some();
        tracing::info!(
            recipe_id = %id,
            name = %name,
            cache_key = %key,
            replaced,
            size,
            "recipe saved"
        );
        if let Some(old) = &evicted {
            tracing::info!(recipe_id = %old, "recipe evicted (LRU)");
        }
        PutOutcome {
            id,
            name,
            replaced,
            skipped: false,
            evicted,
        }
    }

    /// CacheKey 下全部 recipe（最近使用在前）
    pub fn get_candidates(&self, key: &CacheKey) -> Vec<Arc<Recipe>> {
        let mut out: Vec<Arc<Recipe>> = self.read().under(key).cloned().collect();
        out.sort_by_key(|r| std::cmp::Reverse(r.recency()));
        out
    }

    pub fn get(&self, id: &str) -> Option<Arc<Recipe>> {
        self.read().records.get(id).cloned()
    }

    /// 成功回放后刷新最近使用；recipe 已被淘汰时返回 false
    pub fn touch(&self, id: &str) -> bool {
        let inner = self.read();
        match inner.records.get(id) {
            Some(r) => {
                r.mark_used(self.tick());
                true
            }
            None => false,
        }
    }

    /// CacheKey 下 recipe 元数据（最近使用在前）
    pub fn list(&self, key: &CacheKey) -> Vec<RecipeMeta> {
        self.get_candidates(key).iter().map(|r| r.meta()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 每次插入 / 替换 / 淘汰后递增，外层据此重新注册工具
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for RecipeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipeStore")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("revision", &self.revision())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{schema_fingerprint, ApiIdentity};
    use crate::recipe::template::{ParamType, Parameter, RecipeTemplate};
    use serde_json::json;

    fn key(fp: &str) -> CacheKey {
        CacheKey::new(ApiIdentity::graphql("http://api/graphql"), schema_fingerprint(fp))
    }

    fn recipe(key: &CacheKey, question: &str, path: &str) -> Recipe {
        let template: RecipeTemplate = serde_json::from_value(json!({
            "steps": [
                {"type": "api_call", "output": "data", "request": {"kind": "rest", "method": "GET", "path": path,
                  "query_params": {"limit": {"$param": "limit"}}}}
            ]
        }))
        .unwrap();
        Recipe::new(
            key.clone(),
            "list_items".into(),
            question.into(),
            template,
            vec![Parameter {
                name: "limit".into(),
                ty: ParamType::Number,
                default: json!(5),
                source_step: 0,
                source_field: "query_params.limit".into(),
            }],
        )
    }

    #[test]
    fn test_put_and_get_candidates() {
        let store = RecipeStore::new(4);
        let k = key("v1");
        let out = store.put(recipe(&k, "list items", "/items"));
        assert!(!out.skipped && !out.replaced && out.evicted.is_none());
        assert_eq!(store.get_candidates(&k).len(), 1);
        assert!(store.get(&out.id).is_some());
        assert!(store.get_candidates(&key("v2")).is_empty());
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn test_same_question_replaces_in_place() {
        let store = RecipeStore::new(4);
        let k = key("v1");
        let first = store.put(recipe(&k, "List items", "/items"));
        let second = store.put(recipe(&k, "list  items", "/items/all"));
        assert!(second.replaced);
        assert_eq!(second.id, first.id);
        assert_eq!(second.name, "list_items");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_identical_template_is_skipped() {
        let store = RecipeStore::new(4);
        let k = key("v1");
        let first = store.put(recipe(&k, "list items", "/items"));
        let again = store.put(recipe(&k, "show me the items", "/items"));
        assert!(again.skipped);
        assert_eq!(again.id, first.id);
        assert_eq!(store.len(), 1);
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn test_tool_names_are_unique_per_key() {
        let store = RecipeStore::new(4);
        let k = key("v1");
        let a = store.put(recipe(&k, "list items", "/items"));
        let b = store.put(recipe(&k, "list other items", "/other"));
        assert_eq!(a.name, "list_items");
        assert_eq!(b.name, "list_items_2");
        let c = store.put(recipe(&key("v2"), "list items", "/items"));
        assert_eq!(c.name, "list_items");
    }

    #[test]
    fn test_lru_eviction_and_touch() {
        let store = RecipeStore::new(2);
        let k = key("v1");
        let a = store.put(recipe(&k, "a", "/a"));
        let b = store.put(recipe(&k, "b", "/b"));
        assert!(store.touch(&a.id));
        let c = store.put(recipe(&k, "c", "/c"));
        assert_eq!(c.evicted.as_deref(), Some(b.id.as_str()));
        assert!(store.get(&a.id).is_some());
        assert!(store.get(&b.id).is_none());
        assert!(!store.touch(&b.id));
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&a.id).unwrap().use_count(), 1);
    }
}
