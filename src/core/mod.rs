pub mod cert;
pub mod client;
pub mod crypt;
pub mod gcc;
pub mod keys;
pub mod license;
pub mod mcs;
pub mod per;
pub mod sec;
pub mod tpkt;
pub mod x224;

use std::collections::HashMap;

/// LicenseStore provides the ability to save (and later retrieve)
/// RDS licenses, one opaque blob per client host.
pub trait LicenseStore {
    fn write_license(&mut self, host: &str, license: &[u8]);
    fn read_license(&self, host: &str) -> Option<Vec<u8>>;
}

impl<L: LicenseStore + ?Sized> LicenseStore for &mut L {
    fn write_license(&mut self, host: &str, license: &[u8]) {
        (**self).write_license(host, license)
    }

    fn read_license(&self, host: &str) -> Option<Vec<u8>> {
        (**self).read_license(host)
    }
}

impl<T: LicenseStore + ?Sized> LicenseStore for Box<T> {
    fn write_license(&mut self, host: &str, license: &[u8]) {
        (**self).write_license(host, license)
    }

    fn read_license(&self, host: &str) -> Option<Vec<u8>> {
        (**self).read_license(host)
    }
}

/// In memory store
///
/// # Example
/// ```
/// use rdp::core::LicenseStore;
/// use std::collections::HashMap;
/// let mut store: HashMap<String, Vec<u8>> = HashMap::new();
/// store.write_license("host", &[1, 2, 3]);
/// assert_eq!(store.read_license("host"), Some(vec![1, 2, 3]));
/// assert_eq!(store.read_license("other"), None);
/// ```
impl LicenseStore for HashMap<String, Vec<u8>> {
    fn write_license(&mut self, host: &str, license: &[u8]) {
        self.insert(host.to_string(), license.to_vec());
    }

    fn read_license(&self, host: &str) -> Option<Vec<u8>> {
        self.get(host).cloned()
    }
}
