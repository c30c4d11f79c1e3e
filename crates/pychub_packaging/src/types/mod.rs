//! The domain vocabulary shared by every subsystem: distribution names, wheel identities, wheel
//! filenames, PEP 691 project pages and the planning slice of core metadata.

mod dist_metadata;
mod package_name;
mod project_info;
mod wheel_filename;
mod wheel_key;

pub use dist_metadata::{DistMetadata, DistMetadataError};
pub use package_name::{NormalizedPackageName, PackageName, ParsePackageNameError};
pub use project_info::{
    CoreMetadataAvailability, FileHashes, IndexMeta, ProjectFile, ProjectInfo, Yanked,
};
pub use wheel_filename::{BuildTag, ParseWheelFilenameError, WheelFilename};
pub use wheel_key::{
    normalize_version, wheel_filename_from_uri, WheelKey, WheelKeyError, WheelKeyMetadata,
};

pub use pep440_rs::{Version, VersionSpecifier, VersionSpecifiers};
pub use pep508_rs::{MarkerEnvironment, Requirement};
