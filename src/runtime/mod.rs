mod stream;
mod tls;

pub(crate) use self::{
    stream::{write_all_vectored, AsyncStream, BaseStream},
    tls::TlsConfig,
};
