pub mod mountpoint;
pub mod pipeline;
pub mod sdp;
pub mod server;
pub mod types;

mod handler;

pub use mountpoint::{ClientTransport, MediaFactory, MountClient, Mountpoint, PipelineContext, Profile};
pub use pipeline::{
    element, Pipeline, PipelineSpec, PipelineState, StreamSpec, AUDIO_OUTPUT_PT, VIDEO_OUTPUT_PT,
};
pub use sdp::mount_description;
pub use server::{RtspCommand, RtspHandle, RtspRuntime, RuntimeConfig};
pub use types::{Codec, StreamKind};
