use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{debug, trace};

use crate::{
    constants::{PLF_FOLDER, STAGING_PREFIX},
    error::UpdaterError,
    plf,
    product::Product,
    version::PlfVersion,
};

/// What the local store holds for a product at the start of a cycle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Resolved {
    /// Product directory. It exists once [`PlfStore::resolve`] returns.
    pub dir: PathBuf,
    /// Installed image, if any
    pub artifact: Option<PathBuf>,
    /// Version of the installed image. `None` means nothing is installed,
    /// which is distinct from `0.0.0`.
    pub version: Option<PlfVersion>,
}

/// On-disk firmware store: `<root>/plfFolder/<hex4>/<image>.plf`.
#[derive(Clone, Debug)]
pub struct PlfStore {
    plf_folder: PathBuf,
}

impl PlfStore {
    pub fn new(root: &Path) -> Result<Self, UpdaterError> {
        if root.as_os_str().is_empty() {
            return Err(UpdaterError::BadParameter("Root folder is empty".to_owned()));
        }

        Ok(Self {
            plf_folder: root.join(PLF_FOLDER),
        })
    }

    pub fn plf_folder(&self) -> &Path {
        &self.plf_folder
    }

    pub fn product_dir(&self, product: Product) -> PathBuf {
        self.plf_folder.join(product.hex())
    }

    /// Path a download is written to before it is verified.
    pub fn staging_path(&self, product: Product, file_name: &str) -> PathBuf {
        self.product_dir(product).join(format!("{STAGING_PREFIX}{file_name}"))
    }

    /// Look up the installed image and its version without touching the
    /// filesystem.
    pub fn installed(&self, product: Product) -> Result<Option<(PathBuf, PlfVersion)>, UpdaterError> {
        let dir = self.product_dir(product);

        match plf::find_plf_in_folder(&dir)? {
            Some(name) => {
                let path = dir.join(name);
                let version = plf::read_version(&path)?;
                trace!("[{}] Installed image {:?} is version {}", product, path, version);
                Ok(Some((path, version)))
            }
            None => Ok(None),
        }
    }

    /// Determine the installed version of a product. Having no image is the
    /// normal first-run state: the product directory is created so the
    /// download can be staged next to where the image will live.
    pub fn resolve(&self, product: Product) -> Result<Resolved, UpdaterError> {
        let dir = self.product_dir(product);

        let (artifact, version) = match self.installed(product)? {
            Some((path, version)) => (Some(path), Some(version)),
            None => {
                debug!("[{}] No installed image; creating {:?}", product, dir);
                fs::create_dir_all(&dir)?;
                (None, None)
            }
        };

        Ok(Resolved { dir, artifact, version })
    }

    /// Installed version of every product in `products`, for reporting.
    pub fn inventory(&self, products: &[Product]) -> Vec<(Product, Result<Option<PlfVersion>, UpdaterError>)> {
        products.iter()
            .map(|p| (*p, self.installed(*p).map(|i| i.map(|(_, v)| v))))
            .collect()
    }

    /// Whether a device running `device_version` already has the image this
    /// store would give it. Also returns the version of the local image. With
    /// no local image there is nothing to upload, so the device counts as up
    /// to date.
    pub fn is_up_to_date(
        &self,
        product: Product,
        device_version: PlfVersion,
    ) -> Result<(bool, Option<PlfVersion>), UpdaterError> {
        let local = self.installed(product)?.map(|(_, v)| v);
        let up_to_date = local.map_or(true, |v| device_version >= v);

        debug!("[{}] Device version {}, local version {}: up to date = {}",
               product, device_version, PlfVersion::query_string(local), up_to_date);

        Ok((up_to_date, local))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::plf::PlfHeader;

    use super::*;

    fn write_plf(path: &Path, version: PlfVersion) {
        let header = PlfHeader {
            version,
            ..Default::default()
        };
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, header.to_bytes()).unwrap();
    }

    #[test]
    fn test_empty_root() {
        assert_matches!(PlfStore::new(Path::new("")), Err(UpdaterError::BadParameter(_)));
    }

    #[test]
    fn test_layout() {
        let store = PlfStore::new(Path::new("/data")).unwrap();

        assert_eq!(store.product_dir(Product::ArDrone3), Path::new("/data/plfFolder/0901"));
        assert_eq!(store.staging_path(Product::Bebop2, "fw.plf"),
                   Path::new("/data/plfFolder/090c/tmp_fw.plf"));
    }

    #[test]
    fn test_resolve_absent_creates_dir() {
        let root = tempfile::tempdir().unwrap();
        let store = PlfStore::new(root.path()).unwrap();

        for product in Product::all() {
            let resolved = store.resolve(*product).unwrap();
            assert_eq!(resolved.version, None);
            assert_eq!(resolved.artifact, None);
            assert!(resolved.dir.is_dir());
        }
    }

    #[test]
    fn test_resolve_installed() {
        let root = tempfile::tempdir().unwrap();
        let store = PlfStore::new(root.path()).unwrap();
        let dir = store.product_dir(Product::JumpingSumo);
        let path = dir.join("jumping_sumo.plf");

        write_plf(&path, PlfVersion::new(1, 2, 3));
        // Staging files never count
        write_plf(&dir.join("tmp_jumping_sumo.plf"), PlfVersion::new(9, 9, 9));

        let resolved = store.resolve(Product::JumpingSumo).unwrap();
        assert_eq!(resolved.artifact, Some(path));
        assert_eq!(resolved.version, Some(PlfVersion::new(1, 2, 3)));
    }

    #[test]
    fn test_resolve_corrupt() {
        let root = tempfile::tempdir().unwrap();
        let store = PlfStore::new(root.path()).unwrap();
        let dir = store.product_dir(Product::MiniDrone);

        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("fw.plf"), b"garbage").unwrap();

        assert_matches!(store.resolve(Product::MiniDrone), Err(UpdaterError::Plf(_)));
    }

    #[test]
    fn test_installed_is_read_only() {
        let root = tempfile::tempdir().unwrap();
        let store = PlfStore::new(root.path()).unwrap();

        assert_matches!(store.installed(Product::ArDrone3), Ok(None));
        assert!(!store.plf_folder().exists());
    }

    #[test]
    fn test_is_up_to_date() {
        let root = tempfile::tempdir().unwrap();
        let store = PlfStore::new(root.path()).unwrap();

        assert_matches!(store.is_up_to_date(Product::Bebop2, PlfVersion::new(1, 0, 0)),
                        Ok((true, None)));

        let local = PlfVersion::new(3, 3, 0);
        write_plf(&store.product_dir(Product::Bebop2).join("bebop2.plf"), local);

        assert_matches!(store.is_up_to_date(Product::Bebop2, PlfVersion::new(3, 2, 9)),
                        Ok((false, Some(v))) if v == local);
        assert_matches!(store.is_up_to_date(Product::Bebop2, local),
                        Ok((true, Some(_))));
        assert_matches!(store.is_up_to_date(Product::Bebop2, PlfVersion::new(4, 0, 0)),
                        Ok((true, Some(_))));
    }
}
