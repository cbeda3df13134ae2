//! A renderer that accepts every command and draws nothing.
//!
//! It keeps the bookkeeping a real driver would (submission sequence numbers, blob lifetimes) so clients can be
//! exercised end to end without a GPU.

use std::{collections::HashMap, fs::File, os::fd::OwnedFd};

use serde::{Deserialize, Serialize};

use crate::interpreter::{
    CommandInterpreter, ContextInfo, InterpretError, InterpreterFactory, Reply, Request,
};

pub type BlobId = u32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderRequest {
    Nop,
    Submit { commands: Vec<u8> },
    /// Answered with a handle to a new anonymous file of `size` bytes.
    CreateBlob { blob_id: BlobId, size: u64 },
    /// Carries the handle of the blob to import.
    ImportBlob { blob_id: BlobId },
    DestroyBlob { blob_id: BlobId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenderReply {
    Submitted { seqno: u64, bytes: u64 },
    BlobCreated { ok: bool },
    BlobImported { ok: bool, size: u64 },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRenderer;

impl InterpreterFactory for NoopRenderer {
    fn create(&self, info: &ContextInfo) -> Result<Box<dyn CommandInterpreter>, InterpretError> {
        tracing::debug!(ctx_id = info.ctx_id, name = %info.name, "creating noop context");
        Ok(Box::new(NoopContext::default()))
    }
}

#[derive(Debug, Default)]
struct NoopContext {
    seqno: u64,
    blobs: HashMap<BlobId, File>,
}

impl NoopContext {
    fn create_blob(&mut self, blob_id: BlobId, size: u64) -> Result<Option<OwnedFd>, InterpretError> {
        if self.blobs.contains_key(&blob_id) {
            return Ok(None);
        }

        let file = tempfile::tempfile()?;
        file.set_len(size)?;
        let handle = OwnedFd::from(file.try_clone()?);
        self.blobs.insert(blob_id, file);
        Ok(Some(handle))
    }

    fn import_blob(&mut self, blob_id: BlobId, mut handles: Vec<OwnedFd>) -> Result<Option<u64>, InterpretError> {
        if handles.len() != 1 || self.blobs.contains_key(&blob_id) {
            return Ok(None);
        }

        let Some(handle) = handles.pop() else {
            return Ok(None);
        };
        let file = File::from(handle);
        let size = file.metadata()?.len();
        self.blobs.insert(blob_id, file);
        Ok(Some(size))
    }
}

impl CommandInterpreter for NoopContext {
    fn interpret(&mut self, request: Request<'_>) -> Result<Option<Reply>, InterpretError> {
        let Request {
            ctx_id,
            payload,
            handles,
        } = request;

        let request: RenderRequest = postcard::from_bytes(payload)?;
        let (reply, handles) = match request {
            RenderRequest::Nop => return Ok(None),
            RenderRequest::Submit { commands } => {
                self.seqno += 1;
                tracing::trace!(ctx_id, seqno = self.seqno, len = commands.len(), "submitted");
                let reply = RenderReply::Submitted {
                    seqno: self.seqno,
                    bytes: commands.len() as u64,
                };
                (reply, Vec::new())
            }
            RenderRequest::CreateBlob { blob_id, size } => match self.create_blob(blob_id, size) {
                Ok(Some(handle)) => (RenderReply::BlobCreated { ok: true }, vec![handle]),
                Ok(None) => (RenderReply::BlobCreated { ok: false }, Vec::new()),
                Err(error) => {
                    tracing::warn!(?error, ctx_id, blob_id, size, "failed to create blob");
                    (RenderReply::BlobCreated { ok: false }, Vec::new())
                }
            },
            RenderRequest::ImportBlob { blob_id } => {
                let reply = match self.import_blob(blob_id, handles) {
                    Ok(Some(size)) => RenderReply::BlobImported { ok: true, size },
                    Ok(None) => RenderReply::BlobImported { ok: false, size: 0 },
                    Err(error) => {
                        tracing::warn!(?error, ctx_id, blob_id, "failed to import blob");
                        RenderReply::BlobImported { ok: false, size: 0 }
                    }
                };
                (reply, Vec::new())
            }
            RenderRequest::DestroyBlob { blob_id } => {
                if self.blobs.remove(&blob_id).is_none() {
                    tracing::debug!(ctx_id, blob_id, "destroying unknown blob");
                }
                return Ok(None);
            }
        };

        Ok(Some(Reply {
            payload: postcard::to_allocvec(&reply)?,
            handles,
        }))
    }
}

#[cfg(test)]
mod test {
    use std::{
        fs::File,
        io::Write,
        os::fd::OwnedFd,
    };

    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};

    use super::{NoopRenderer, RenderReply, RenderRequest};
    use crate::interpreter::{
        CommandInterpreter, ContextInfo, InterpretError, InterpreterFactory, Request,
    };

    #[fixture]
    fn context() -> Box<dyn CommandInterpreter> {
        let info = ContextInfo {
            ctx_id: 1,
            flags: 0,
            name: "test".into(),
        };
        NoopRenderer.create(&info).unwrap()
    }

    fn call(
        context: &mut dyn CommandInterpreter,
        request: &RenderRequest,
        handles: Vec<OwnedFd>,
    ) -> anyhow::Result<Option<(RenderReply, Vec<OwnedFd>)>> {
        let payload = postcard::to_allocvec(request)?;
        let reply = context.interpret(Request {
            ctx_id: 1,
            payload: &payload,
            handles,
        })?;

        Ok(match reply {
            Some(reply) => Some((postcard::from_bytes(&reply.payload)?, reply.handles)),
            None => None,
        })
    }

    #[rstest]
    fn submissions_are_numbered(mut context: Box<dyn CommandInterpreter>) -> anyhow::Result<()> {
        assert!(call(context.as_mut(), &RenderRequest::Nop, Vec::new())?.is_none());

        for seqno in 1..=3 {
            let request = RenderRequest::Submit {
                commands: vec![0; 16 * seqno as usize],
            };
            let (reply, handles) = call(context.as_mut(), &request, Vec::new())?.unwrap();
            assert_eq!(
                reply,
                RenderReply::Submitted {
                    seqno,
                    bytes: 16 * seqno
                }
            );
            assert!(handles.is_empty());
        }
        Ok(())
    }

    #[rstest]
    fn blobs(mut context: Box<dyn CommandInterpreter>) -> anyhow::Result<()> {
        let create = RenderRequest::CreateBlob {
            blob_id: 1,
            size: 4096,
        };
        let (reply, mut handles) = call(context.as_mut(), &create, Vec::new())?.unwrap();
        assert_eq!(reply, RenderReply::BlobCreated { ok: true });
        assert_eq!(File::from(handles.remove(0)).metadata()?.len(), 4096);

        let (reply, handles) = call(context.as_mut(), &create, Vec::new())?.unwrap();
        assert_eq!(reply, RenderReply::BlobCreated { ok: false });
        assert!(handles.is_empty());

        let mut file = tempfile::tempfile()?;
        file.write_all(&[1; 100])?;
        let import = RenderRequest::ImportBlob { blob_id: 2 };
        let (reply, _) = call(context.as_mut(), &import, vec![file.into()])?.unwrap();
        assert_eq!(reply, RenderReply::BlobImported { ok: true, size: 100 });

        let (reply, _) = call(context.as_mut(), &RenderRequest::ImportBlob { blob_id: 3 }, Vec::new())?.unwrap();
        assert_eq!(reply, RenderReply::BlobImported { ok: false, size: 0 });

        assert!(call(context.as_mut(), &RenderRequest::DestroyBlob { blob_id: 2 }, Vec::new())?.is_none());
        let (reply, _) = call(context.as_mut(), &import, vec![tempfile::tempfile()?.into()])?.unwrap();
        assert_eq!(reply, RenderReply::BlobImported { ok: true, size: 0 });
        Ok(())
    }

    #[rstest]
    fn garbage_is_rejected(mut context: Box<dyn CommandInterpreter>) {
        let result = context.interpret(Request {
            ctx_id: 1,
            payload: &[0xff, 0xff],
            handles: Vec::new(),
        });
        assert!(matches!(result, Err(InterpretError::Decode(_))));
    }
}
