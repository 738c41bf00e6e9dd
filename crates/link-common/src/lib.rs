pub mod cms;
pub mod document;
pub mod embed_client;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod inject;
pub mod matcher;
pub mod similarity;
pub mod supervisor;
