//! Driver construction by kind or by recorded name

use crate::config::{DriverConfig, DriverKind, Mode};
use crate::driver::Driver;
use crate::error::Result;
use crate::memory::MemoryDriver;
use crate::slab::SlabDriver;
use crate::sqlite::SqliteDriver;

/// Build a closed driver for `config`
pub fn create_driver(config: DriverConfig, name: &str, group_name: Option<&str>) -> Box<dyn Driver> {
    match config.kind {
        DriverKind::Memory => Box::new(MemoryDriver::new(config, name, group_name)),
        DriverKind::Sqlite => Box::new(SqliteDriver::new(config, name, group_name)),
        DriverKind::Slab => Box::new(SlabDriver::new(config, name, group_name)),
    }
}

/// Rebuild a driver from the fields a catalog row records
pub fn driver_from_name(
    driver_name: &str,
    path: &str,
    mode: Mode,
    name: &str,
    group_name: Option<&str>,
) -> Result<Box<dyn Driver>> {
    let kind: DriverKind = driver_name.parse()?;
    let config = DriverConfig::new(kind, path).with_mode(mode);
    Ok(create_driver(config, name, group_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use test_case::test_case;

    #[test_case("Memory", false)]
    #[test_case("Sqlite", true)]
    #[test_case("Slab", true)]
    fn test_driver_from_name(driver_name: &str, persistent: bool) {
        let driver = driver_from_name(driver_name, "data", Mode::Read, "iris", Some("v1")).unwrap();
        assert_eq!(driver.driver_name(), driver_name);
        assert_eq!(driver.persistent(), persistent);
        assert_eq!(driver.mode(), Mode::Read);
        assert_eq!(driver.group_name(), Some("v1"));
        assert!(!driver.is_open());
    }

    #[test]
    fn test_unknown_driver_name() {
        let err = driver_from_name("Zarr", "data", Mode::Read, "iris", None).unwrap_err();
        assert!(matches!(err, Error::UnknownDriver(_)));
    }
}
