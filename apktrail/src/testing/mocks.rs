use std::ffi::OsString;
use std::io;

use mockall::mock;

use crate::command::CmdOutput;
use crate::download::{FetchError, SourceResponse};

mock! {
    pub Source {}

    impl crate::download::ArtifactSource for Source {
        fn get(&self, credential: &str, content_hash: &str) -> Result<SourceResponse, FetchError>;
    }
}

mock! {
    pub Runner {}

    impl crate::command::CommandRunner for Runner {
        fn run(&self, cmd: &str, args: &[OsString]) -> io::Result<CmdOutput>;
    }
}
