use crate::{
    archive,
    error::DetectorError,
    model_service::ModelService,
    sandbox::{ClientName, SandboxManager},
};
use std::path::Path;

/// Sub-directory of a client sandbox holding the unpacked model package.
const MODEL_DIR: &str = "model";

/// Turns model packages into loaded models, one sandbox per client.
pub struct ModelManager<M: ModelService> {
    service: M,
    sandboxes: SandboxManager,
}

impl<M: ModelService> ModelManager<M> {
    pub fn new(service: M, sandboxes: SandboxManager) -> Self {
        Self { service, sandboxes }
    }

    pub fn sandboxes(&self) -> &SandboxManager {
        &self.sandboxes
    }

    pub fn load_package(
        &self,
        client: &ClientName,
        archive_path: &Path,
    ) -> Result<M::Model, DetectorError> {
        let dest = self.sandboxes.client_dir(client)?.join(MODEL_DIR);
        let extracted = archive::unpack(archive_path, &dest)?;
        tracing::debug!(
            "{} files unpacked into {:?}",
            extracted.files().len(),
            extracted.root()
        );

        let descriptor =
            extracted
                .locate(M::DESCRIPTOR_ID)
                .ok_or_else(|| DetectorError::MissingDescriptor {
                    archive: archive_path.to_path_buf(),
                    id: M::DESCRIPTOR_ID.to_string(),
                })?;

        let model = self
            .service
            .load(descriptor)
            .map_err(|e| DetectorError::CorruptDescriptor {
                path: descriptor.to_path_buf(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            "Loaded model {:?} for {} from {:?}",
            descriptor,
            client,
            archive_path
        );

        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archive::tests::write_package,
        testing::{write_model_package, MockModelService},
    };

    fn manager(root: &Path) -> ModelManager<MockModelService> {
        ModelManager::new(MockModelService, SandboxManager::new(root.join("clients")))
    }

    #[test]
    fn test_load_package() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let package = tmp.path().join("ships.tar.gz");
        write_model_package(&package, "12")?;
        let client = ClientName::new("Detector", "peer1");
        let manager = manager(tmp.path());

        let model = manager.load_package(&client, &package)?;

        assert_eq!(model.id, 12);
        let sandbox = manager.sandboxes().client_dir(&client)?;
        assert!(sandbox.join("model/usageOrder.txt").is_file());

        Ok(())
    }

    #[test]
    fn test_descriptor_must_be_registered() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let package = tmp.path().join("unregistered.tar.gz");
        write_package(&package, &[("model/descriptor.txt", &b"12"[..])], true)?;

        let result = manager(tmp.path()).load_package(&ClientName::new("Detector", "p"), &package);

        assert!(matches!(
            result,
            Err(DetectorError::MissingDescriptor { ref id, .. }) if id == "MODELFILE"
        ));

        Ok(())
    }

    #[test]
    fn test_unloadable_descriptor_is_corrupt() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let package = tmp.path().join("corrupt.tar.gz");
        write_model_package(&package, "not a number")?;

        let result = manager(tmp.path()).load_package(&ClientName::new("Detector", "p"), &package);

        assert!(matches!(result, Err(DetectorError::CorruptDescriptor { .. })));

        Ok(())
    }

    #[test]
    fn test_sandbox_failure_aborts_before_unpacking() -> Result<(), Box<dyn std::error::Error>> {
        let tmp = tempfile::tempdir()?;
        let package = tmp.path().join("ships.tar.gz");
        write_model_package(&package, "1")?;
        std::fs::write(tmp.path().join("clients"), b"a file, not a directory")?;

        let result = manager(tmp.path()).load_package(&ClientName::new("Detector", "p"), &package);

        assert!(matches!(
            result,
            Err(DetectorError::SandboxCreationFailed { .. })
        ));

        Ok(())
    }
}
