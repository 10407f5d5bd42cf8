/// Host serving both the version check endpoint and the firmware images
pub const SERVER_HOST: &str = "download.parrot.com";

/// Port of the version check endpoint (plain HTTP)
pub const SERVER_PORT: u16 = 80;

/// Serial number sent to the version check endpoint. The server does not
/// look at it, but the parameter must be present.
pub const SERIAL_PLACEHOLDER: &str = "0000";

/// Folder below the root folder that holds one directory per product
pub const PLF_FOLDER: &str = "plfFolder";

/// Extension of firmware images
pub const PLF_EXTENSION: &str = "plf";

/// Prefix of a downloaded image until its checksum has been verified
pub const STAGING_PREFIX: &str = "tmp_";

/// Name of the checksum file pushed to a device next to an uploaded image
pub const MD5_FILE_NAME: &str = "md5_check.md5";
