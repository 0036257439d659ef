//! Owned registries for backend instances that should be shared.
//!
//! [`SessionCache`] keeps one instance per distinct settings value and hands
//! out clones. [`SessionSlot`] keeps a single live instance and refuses to
//! hand it out under different settings.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};

use crate::error::AppError;

/// Reuses instances created with equal settings.
#[derive(Debug)]
pub struct SessionCache<S, B> {
    entries: Mutex<Vec<(S, B)>>,
}

impl<S, B> Default for SessionCache<S, B> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<S: PartialEq + Clone, B: Clone> SessionCache<S, B> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<(S, B)>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned session cache mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the instance built with `settings`, creating it on first use.
    pub fn get_or_create<F>(&self, settings: &S, create: F) -> Result<B, AppError>
    where
        F: FnOnce(&S) -> Result<B, AppError>,
    {
        let mut entries = self.lock_entries();
        if let Some((_, instance)) = entries.iter().find(|(s, _)| s == settings) {
            return Ok(instance.clone());
        }

        let instance = create(settings)?;
        entries.push((settings.clone(), instance.clone()));
        tracing::debug!(live = entries.len(), "Created shared session");
        Ok(instance)
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock_entries().clear();
    }
}

/// Holds at most one live instance.
#[derive(Debug)]
pub struct SessionSlot<S, B> {
    slot: tokio::sync::Mutex<Option<(S, B)>>,
}

impl<S, B> Default for SessionSlot<S, B> {
    fn default() -> Self {
        Self {
            slot: tokio::sync::Mutex::new(None),
        }
    }
}

impl<S: PartialEq + Clone, B: Clone> SessionSlot<S, B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live instance if its settings equal `settings`, or
    /// creates one when the slot is free.
    ///
    /// Asking for different settings while an instance is live is a
    /// configuration error.
    pub async fn get_or_create<F, Fut>(&self, settings: &S, create: F) -> Result<B, AppError>
    where
        F: FnOnce(S) -> Fut,
        Fut: Future<Output = Result<B, AppError>>,
    {
        let mut slot = self.slot.lock().await;
        match slot.as_ref() {
            Some((live, instance)) if live == settings => Ok(instance.clone()),
            Some(_) => Err(AppError::Config(
                "A live session with different settings already exists; release it first".into(),
            )),
            None => {
                let instance = create(settings.clone()).await?;
                *slot = Some((settings.clone(), instance.clone()));
                tracing::debug!("Created exclusive session");
                Ok(instance)
            }
        }
    }

    pub async fn is_live(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Frees the slot and returns the instance that held it.
    pub async fn release(&self) -> Option<B> {
        self.slot.lock().await.take().map(|(_, instance)| instance)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn cache_shares_instances_with_equal_settings() {
        let created = AtomicUsize::new(0);
        let cache: SessionCache<String, Arc<usize>> = SessionCache::new();
        let create = |_: &String| Ok(Arc::new(created.fetch_add(1, Ordering::SeqCst)));

        let a = cache.get_or_create(&"proxy-a".to_string(), create).unwrap();
        let a2 = cache.get_or_create(&"proxy-a".to_string(), create).unwrap();
        let b = cache.get_or_create(&"proxy-b".to_string(), create).unwrap();

        assert!(Arc::ptr_eq(&a, &a2));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_does_not_keep_failed_creations() {
        let cache: SessionCache<u8, u8> = SessionCache::new();
        let err = cache.get_or_create(&1, |_| Err(AppError::Config("no".into())));
        assert!(err.is_err());
        assert!(cache.is_empty());

        cache.clear();
        assert_eq!(cache.get_or_create(&1, |s| Ok(*s + 1)).unwrap(), 2);
    }

    #[tokio::test]
    async fn slot_reuses_matching_settings() {
        let slot: SessionSlot<u32, Arc<u32>> = SessionSlot::new();

        let first = slot.get_or_create(&7, |s| async move { Ok(Arc::new(s)) }).await.unwrap();
        let again = slot
            .get_or_create(&7, |s| async move { Ok(Arc::new(s + 100)) })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &again));
        assert!(slot.is_live().await);
    }

    #[tokio::test]
    async fn slot_rejects_mismatched_settings_until_released() {
        let slot: SessionSlot<u32, u32> = SessionSlot::new();
        slot.get_or_create(&1, |s| async move { Ok(s) }).await.unwrap();

        let err = slot.get_or_create(&2, |s| async move { Ok(s) }).await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        assert_eq!(slot.release().await, Some(1));
        assert!(!slot.is_live().await);
        assert_eq!(slot.get_or_create(&2, |s| async move { Ok(s) }).await.unwrap(), 2);
    }
}
