mod client;
mod oauth;

pub use client::{
    ApiErrorClass, ByteStream, DriveClient, DriveError, DriveFile, DriveFolder, FOLDER_MIME_TYPE,
};
pub use oauth::{OAuthClient, OAuthError, OAuthToken};
