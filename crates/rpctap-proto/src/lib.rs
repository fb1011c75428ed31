mod decode;
mod registry;

pub use decode::{
    decode_frame, decode_json_body, decode_unary_body, split_method_path, GrpcMessage,
};
pub use registry::{MessageRegistry, RegistryError};
