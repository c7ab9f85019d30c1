//! Links onto an in-process virtual controller

use std::io;

use pam_sim::{SharedPam, VirtualPort};

use crate::link::{Connector, PamPort};

impl PamPort for VirtualPort {
    fn clear_input(&mut self) -> io::Result<()> {
        VirtualPort::clear_input(self)
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        VirtualPort::bytes_to_read(self)
    }
}

/// Connects to an in-process virtual controller
#[derive(Clone)]
pub struct SimConnector {
    pam: SharedPam,
}

impl SimConnector {
    pub fn new(pam: SharedPam) -> Self {
        Self { pam }
    }
}

impl Connector for SimConnector {
    fn open(&self) -> io::Result<Box<dyn PamPort>> {
        Ok(Box::new(VirtualPort::open(&self.pam)?))
    }

    fn endpoint(&self) -> String {
        let id = self
            .pam
            .lock()
            .map(|pam| pam.id().to_string())
            .unwrap_or_else(|_| "poisoned".to_string());
        format!("virtual:{}", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pam_sim::VirtualPam;

    #[test]
    fn test_endpoint_names_the_controller() {
        let pam = VirtualPam::new("bench").shared();
        assert_eq!(SimConnector::new(pam).endpoint(), "virtual:bench");
    }

    #[test]
    fn test_open_respects_failed_opens() {
        let pam = VirtualPam::new("bench").shared();
        pam.lock().unwrap().fail_next_opens(1);
        let connector = SimConnector::new(pam.clone());

        assert!(connector.open().is_err());
        assert!(connector.open().is_ok());
    }
}
