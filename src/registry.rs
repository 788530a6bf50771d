//! Every owned and followed site known to the process.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::engine::followed::classify_follow;
use crate::engine::{FollowedHandle, OwnedHandle, Services};
use crate::error::{PlanetError, Result};
use crate::store;

pub struct SiteRegistry {
    services: Arc<Services>,
    owned: RwLock<BTreeMap<Uuid, Arc<OwnedHandle>>>,
    followed: RwLock<BTreeMap<Uuid, Arc<FollowedHandle>>>,
    /// Canonical addresses of followed sites, including follows still in
    /// their first fetch.
    addresses: Mutex<HashSet<String>>,
}

/// Claim on a followed address; released on drop unless kept.
struct AddressClaim<'a> {
    addresses: &'a Mutex<HashSet<String>>,
    address: Option<String>,
}

impl<'a> AddressClaim<'a> {
    fn take(addresses: &'a Mutex<HashSet<String>>, address: &str) -> Option<Self> {
        let fresh = addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.to_string());
        fresh.then(|| Self {
            addresses,
            address: Some(address.to_string()),
        })
    }

    fn keep(mut self) {
        self.address = None;
    }
}

impl Drop for AddressClaim<'_> {
    fn drop(&mut self) {
        if let Some(address) = self.address.take() {
            self.addresses
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&address);
        }
    }
}

impl std::fmt::Debug for SiteRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteRegistry")
            .field("services", &self.services)
            .finish_non_exhaustive()
    }
}

impl SiteRegistry {
    pub fn empty(services: Arc<Services>) -> Self {
        Self {
            services,
            owned: RwLock::default(),
            followed: RwLock::default(),
            addresses: Mutex::default(),
        }
    }

    /// Read every site under the data directory. A site that fails to load
    /// is logged and left out; the rest still load.
    #[instrument(skip_all)]
    pub async fn load(services: Arc<Services>) -> Result<Self> {
        let layout = &services.layout;
        let mut owned = BTreeMap::new();
        for id in store::list_ids(&layout.my_root()).await? {
            match OwnedHandle::load(layout, id).await {
                Ok(handle) => {
                    owned.insert(id, Arc::new(handle));
                }
                Err(err) => warn!(?err, site = %id, "skipping unreadable owned site"),
            }
        }
        let mut followed = BTreeMap::new();
        let mut addresses = HashSet::new();
        for id in store::list_ids(&layout.following_root()).await? {
            match FollowedHandle::load(layout, id).await {
                Ok(handle) => {
                    addresses.insert(handle.source_address().await);
                    followed.insert(id, Arc::new(handle));
                }
                Err(err) => warn!(?err, site = %id, "skipping unreadable followed site"),
            }
        }
        info!(owned = owned.len(), followed = followed.len(), "sites loaded");
        Ok(Self {
            services,
            owned: RwLock::new(owned),
            followed: RwLock::new(followed),
            addresses: Mutex::new(addresses),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub async fn owned(&self) -> Vec<Arc<OwnedHandle>> {
        self.owned.read().await.values().cloned().collect()
    }

    pub async fn followed(&self) -> Vec<Arc<FollowedHandle>> {
        self.followed.read().await.values().cloned().collect()
    }

    pub async fn owned_site(&self, id: Uuid) -> Result<Arc<OwnedHandle>> {
        self.owned
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| PlanetError::NotFound(format!("owned site {id}")))
    }

    pub async fn followed_site(&self, id: Uuid) -> Result<Arc<FollowedHandle>> {
        self.followed
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| PlanetError::NotFound(format!("followed site {id}")))
    }

    pub async fn create_site(&self, name: &str, about: &str, template: &str) -> Result<Arc<OwnedHandle>> {
        let handle = Arc::new(OwnedHandle::create(&self.services, name, about, template).await?);
        self.owned.write().await.insert(handle.id(), handle.clone());
        Ok(handle)
    }

    /// Follow `address` unless it is already followed or a follow of it is
    /// still in flight.
    pub async fn follow(&self, address: &str) -> Result<Arc<FollowedHandle>> {
        let (_, canonical) = classify_follow(address)?;
        let claim = AddressClaim::take(&self.addresses, &canonical)
            .ok_or_else(|| PlanetError::AlreadyFollowing(canonical.clone()))?;
        let handle = Arc::new(FollowedHandle::follow(&self.services, &canonical).await?);
        self.followed.write().await.insert(handle.id(), handle.clone());
        claim.keep();
        Ok(handle)
    }

    pub async fn unfollow(&self, id: Uuid) -> Result<()> {
        let handle = self.followed_site(id).await?;
        let address = handle.source_address().await;
        handle.unfollow(&self.services).await?;
        self.followed.write().await.remove(&id);
        self.addresses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
        Ok(())
    }

    pub async fn delete_site(&self, id: Uuid) -> Result<()> {
        let handle = self.owned_site(id).await?;
        handle.delete(&self.services).await?;
        self.owned.write().await.remove(&id);
        Ok(())
    }

    pub async fn export_backup(&self, id: Uuid, dir: &Path) -> Result<PathBuf> {
        self.owned_site(id).await?.export_backup(&self.services, dir).await
    }

    pub async fn import_backup(&self, dir: &Path) -> Result<Arc<OwnedHandle>> {
        let handle = Arc::new(OwnedHandle::import_backup(&self.services, dir).await?);
        self.owned.write().await.insert(handle.id(), handle.clone());
        Ok(handle)
    }

    /// Flush every site's metadata and operation markers.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_err = None;
        for handle in self.owned().await {
            if let Err(err) = handle.save(&self.services).await {
                warn!(?err, site = %handle.id(), "failed to flush owned site");
                first_err.get_or_insert(err);
            }
        }
        for handle in self.followed().await {
            if let Err(err) = handle.save(&self.services).await {
                warn!(?err, site = %handle.id(), "failed to flush followed site");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
