//! [`PrivilegedHelper`] backed by the UDisks2 daemon.
use crate::helper::{Access, HelperError, PrivilegedHelper};
use std::collections::HashMap;
use std::os::fd::OwnedFd;
use tracing::debug;
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{OwnedFd as ZOwnedFd, OwnedObjectPath, Value};

const SERVICE: &str = "org.freedesktop.UDisks2";
const MANAGER_PATH: &str = "/org/freedesktop/UDisks2/Manager";
const MANAGER_IFACE: &str = "org.freedesktop.UDisks2.Manager";
const BLOCK_IFACE: &str = "org.freedesktop.UDisks2.Block";
const FILESYSTEM_IFACE: &str = "org.freedesktop.UDisks2.Filesystem";

pub struct UDisks2Helper {
    connection: Connection,
}

fn refused(err: zbus::Error) -> HelperError {
    match err {
        zbus::Error::MethodError(name, msg, _) => HelperError::Refused(format!(
            "{}{}{}",
            name.as_str(),
            if msg.is_some() { ": " } else { "" },
            msg.unwrap_or_default()
        )),
        other => HelperError::Refused(other.to_string()),
    }
}

impl UDisks2Helper {
    /// Connects to the system bus.
    pub fn connect() -> Result<Self, HelperError> {
        let connection =
            Connection::system().map_err(|e| HelperError::Unavailable(e.to_string()))?;
        Ok(Self { connection })
    }

    fn proxy<'a>(&'a self, path: &'a OwnedObjectPath, iface: &'a str) -> Result<Proxy<'a>, HelperError> {
        Proxy::new(&self.connection, SERVICE, path.as_str(), iface).map_err(refused)
    }

    /// Finds the UDisks2 block object whose `DeviceNumber` is `dev`.
    fn block_object(&self, dev: u64) -> Result<OwnedObjectPath, HelperError> {
        let manager = Proxy::new(&self.connection, SERVICE, MANAGER_PATH, MANAGER_IFACE)
            .map_err(refused)?;
        let options: HashMap<&str, Value<'_>> = HashMap::new();
        let paths: Vec<OwnedObjectPath> = manager
            .call("GetBlockDevices", &(options,))
            .map_err(refused)?;

        for path in paths {
            let number: u64 = {
                let block = self.proxy(&path, BLOCK_IFACE)?;
                match block.get_property("DeviceNumber") {
                    Ok(n) => n,
                    Err(_) => continue,
                }
            };
            if number == dev {
                debug!(%path, dev, "resolved udisks block object");
                return Ok(path);
            }
        }
        Err(HelperError::UnknownDevice(dev))
    }
}

impl PrivilegedHelper for UDisks2Helper {
    fn unmount(&self, dev: u64) -> Result<(), HelperError> {
        let path = self.block_object(dev)?;
        let fs = self.proxy(&path, FILESYSTEM_IFACE)?;
        let options: HashMap<&str, Value<'_>> = HashMap::from([("force", Value::from(true))]);
        fs.call_method("Unmount", &(options,)).map_err(refused)?;
        debug!(%path, "unmounted through udisks");
        Ok(())
    }

    fn open_device(&self, dev: u64, access: Access, flags: i32) -> Result<OwnedFd, HelperError> {
        let path = self.block_object(dev)?;
        let block = self.proxy(&path, BLOCK_IFACE)?;
        let mode = match access {
            Access::Read => "r",
            Access::ReadWrite => "rw",
        };
        let options: HashMap<&str, Value<'_>> = HashMap::from([("flags", Value::from(flags))]);
        let fd: ZOwnedFd = block
            .call("OpenDevice", &(mode, options))
            .map_err(refused)?;
        debug!(%path, mode, "opened device through udisks");
        Ok(fd.into())
    }
}
