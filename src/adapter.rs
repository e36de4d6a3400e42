//! Autoscaler post-processing: turn the validated document into the cluster
//! agent's drop-in configuration fragment.

use std::{fs, path::Path};

use tracing::{error, info};

use crate::{config::AdapterSettings, error::SupervisorError, validate::ResultDocument};

/// Extract the address and write `<key>: <value>`. A missing or empty field is
/// fatal and must not be retried.
pub fn write_fragment(
    doc: &ResultDocument,
    settings: &AdapterSettings,
) -> Result<String, SupervisorError> {
    let Some(value) = doc.non_empty_str(&settings.field) else {
        error!(field = %settings.field, "validated output lacks the overlay address");
        return Err(SupervisorError::AutoscalerFieldMissing {
            field: settings.field.clone(),
        });
    };

    let line = format!("{}: {}", settings.config_key, value);
    write_line(&settings.config_path, &line)?;
    info!(
        path = %settings.config_path.display(),
        fragment = %line,
        "wrote node configuration fragment"
    );
    Ok(line)
}

fn write_line(path: &Path, line: &str) -> Result<(), SupervisorError> {
    let write_err = |source| SupervisorError::Write {
        what: "configuration fragment",
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    fs::write(path, format!("{}\n", line)).map_err(write_err)
}
