use std::{
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use log::debug;

use crate::{
    downloader::Downloader,
    error::UpdaterError,
    product::Product,
    store::PlfStore,
    transport::Transport,
    uploader::Uploader,
    version::PlfVersion,
};

/// Owns at most one downloader and one uploader. Each slot can be filled once
/// and emptied only while its worker is idle.
pub struct Manager<T: Transport> {
    downloader: Mutex<Option<Arc<Downloader<T>>>>,
    uploader: Mutex<Option<Arc<Uploader<T>>>>,
}

impl<T: Transport> Default for Manager<T> {
    fn default() -> Self {
        Self {
            downloader: Mutex::new(None),
            uploader: Mutex::new(None),
        }
    }
}

fn lock<V>(slot: &Mutex<V>) -> Result<MutexGuard<'_, V>, UpdaterError> {
    slot.lock().map_err(|_| UpdaterError::SystemResource("Manager lock is poisoned".to_owned()))
}

impl<T: Transport> Manager<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_downloader(&self, downloader: Downloader<T>) -> Result<Arc<Downloader<T>>, UpdaterError> {
        let mut slot = lock(&self.downloader)?;
        if slot.is_some() {
            return Err(UpdaterError::AlreadyInitialized);
        }

        let downloader = Arc::new(downloader);
        *slot = Some(downloader.clone());

        Ok(downloader)
    }

    pub fn downloader(&self) -> Result<Arc<Downloader<T>>, UpdaterError> {
        lock(&self.downloader)?.clone().ok_or(UpdaterError::NotInitialized)
    }

    /// Drop the downloader. Refused while it is running: cancel it and wait
    /// for the worker to exit first.
    pub fn delete_downloader(&self) -> Result<(), UpdaterError> {
        let mut slot = lock(&self.downloader)?;

        match slot.as_ref() {
            None => Err(UpdaterError::NotInitialized),
            Some(d) if d.is_running() => Err(UpdaterError::ThreadBusy),
            Some(_) => {
                debug!("Deleting downloader");
                *slot = None;
                Ok(())
            }
        }
    }

    pub fn set_uploader(&self, uploader: Uploader<T>) -> Result<Arc<Uploader<T>>, UpdaterError> {
        let mut slot = lock(&self.uploader)?;
        if slot.is_some() {
            return Err(UpdaterError::AlreadyInitialized);
        }

        let uploader = Arc::new(uploader);
        *slot = Some(uploader.clone());

        Ok(uploader)
    }

    pub fn uploader(&self) -> Result<Arc<Uploader<T>>, UpdaterError> {
        lock(&self.uploader)?.clone().ok_or(UpdaterError::NotInitialized)
    }

    /// Drop the uploader. Refused while it is running.
    pub fn delete_uploader(&self) -> Result<(), UpdaterError> {
        let mut slot = lock(&self.uploader)?;

        match slot.as_ref() {
            None => Err(UpdaterError::NotInitialized),
            Some(u) if u.is_running() => Err(UpdaterError::ThreadBusy),
            Some(_) => {
                debug!("Deleting uploader");
                *slot = None;
                Ok(())
            }
        }
    }

    /// Whether a device of type `product` running `device_version` is at
    /// least as new as the image stored under `root`. Also returns the
    /// version of the stored image, if there is one.
    pub fn plf_version_is_up_to_date(
        &self,
        root: &Path,
        product: Product,
        device_version: PlfVersion,
    ) -> Result<(bool, Option<PlfVersion>), UpdaterError> {
        PlfStore::new(root)?.is_up_to_date(product, device_version)
    }
}
