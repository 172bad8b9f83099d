//! Per-device-type dispatch tables.
//!
//! A [`FunctionTable`] is built once per device type with a
//! [`FunctionTableBuilder`] and shared by reference between all instances of
//! that type. It maps function IDs to tagged entries:
//!
//! - requests: either a local [`FunctionSpec`] or a request-passthrough
//!   filter. One map holds both, so local and passthrough IDs are disjoint.
//! - upstream responses and upstream callbacks: passthrough filters deciding
//!   whether traffic from the upstream daemon is forwarded to clients. An ID
//!   may appear in at most one of the two.
//!
//! The builder records the first registration error and reports it from
//! [`FunctionTableBuilder::build`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use brickemu_core::packet::{MAX_PAYLOAD_LEN, RESERVED_FUNCTION_IDS};
use brickemu_core::{CodecError, Format};
use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::capability::{self, Capabilities};
use crate::device::DeviceContext;
use crate::handler::{Args, HandlerResult, Outcome};

/// Errors raised while building a [`FunctionTable`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    /// The function ID is already registered in the same namespace.
    #[error("{type_name}: function ID {function_id} registered twice ({first} and {second})")]
    DuplicateFunctionId {
        /// Device type.
        type_name: String,
        /// Conflicting ID.
        function_id: u8,
        /// Name of the first registration.
        first: String,
        /// Name of the rejected registration.
        second: String,
    },

    /// The function ID is reserved for the enumerate capability.
    #[error("{type_name}: function ID {function_id} ({name}) is reserved")]
    ReservedFunctionId {
        /// Device type.
        type_name: String,
        /// Reserved ID.
        function_id: u8,
        /// Name of the rejected registration.
        name: String,
    },

    /// Function ID 0 is never valid.
    #[error("{type_name}: function ID 0 ({name}) is invalid")]
    ZeroFunctionId {
        /// Device type.
        type_name: String,
        /// Name of the rejected registration.
        name: String,
    },

    /// A format string could not be parsed.
    #[error("{type_name}: bad format for {name}: {source}")]
    Format {
        /// Device type.
        type_name: String,
        /// Name of the registration.
        name: String,
        /// Parse error.
        #[source]
        source: CodecError,
    },

    /// A format describes more bytes than fit into one packet.
    #[error("{type_name}: format of {name} needs {size} bytes, at most {MAX_PAYLOAD_LEN} fit")]
    PayloadTooLarge {
        /// Device type.
        type_name: String,
        /// Name of the registration.
        name: String,
        /// Encoded size.
        size: usize,
    },
}

/// Function handler.
pub type FunctionHandler<S> =
    Arc<dyn Fn(DeviceContext<S>, Args) -> BoxFuture<'static, HandlerResult<Outcome>> + Send + Sync>;

/// Passthrough filter: `true` forwards, `false` drops.
pub type FilterHandler<S> =
    Arc<dyn Fn(DeviceContext<S>, Args) -> BoxFuture<'static, HandlerResult<bool>> + Send + Sync>;

/// Background task run while the device is attached to a running daemon.
pub type AutorunHandler<S> = Arc<dyn Fn(DeviceContext<S>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Boxes an async function into a [`FunctionHandler`].
pub(crate) fn function_handler<S, F, Fut>(handler: F) -> FunctionHandler<S>
where
    F: Fn(DeviceContext<S>, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Outcome>> + Send + 'static,
{
    Arc::new(move |ctx: DeviceContext<S>, args: Args| handler(ctx, args).boxed())
}

/// A local function.
pub struct FunctionSpec<S> {
    /// Function ID.
    pub function_id: u8,
    /// Function name used in diagnostics.
    pub name: String,
    /// Request payload format.
    pub input: Format,
    /// Response payload format.
    pub output: Format,
    /// Handler.
    pub handler: FunctionHandler<S>,
}

/// A passthrough filter for one function or callback ID.
pub struct PassthroughSpec<S> {
    /// Function or callback ID.
    pub function_id: u8,
    /// Name used in diagnostics.
    pub name: String,
    /// Payload format handed to the filter.
    pub format: Format,
    /// Filter.
    pub handler: FilterHandler<S>,
}

/// A background task registration.
pub struct AutorunSpec<S> {
    /// Task name used in diagnostics.
    pub name: String,
    /// Task body.
    pub handler: AutorunHandler<S>,
}

/// Entry of the request map.
pub enum RequestEntry<S> {
    /// Handled locally.
    Function(FunctionSpec<S>),
    /// Filtered, then forwarded upstream or dropped.
    Passthrough(PassthroughSpec<S>),
}

impl<S> RequestEntry<S> {
    /// Name of the registration.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Function(spec) => &spec.name,
            Self::Passthrough(spec) => &spec.name,
        }
    }
}

/// Kind of packet received from an upstream daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamCategory {
    /// Sequence number is nonzero.
    Response,
    /// Sequence number is zero.
    Callback,
}

impl UpstreamCategory {
    /// Classifies by sequence number.
    #[must_use]
    pub const fn from_sequence_number(sequence_number: u8) -> Self {
        if sequence_number == 0 {
            Self::Callback
        } else {
            Self::Response
        }
    }
}

impl fmt::Display for UpstreamCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Response => "response",
            Self::Callback => "callback",
        })
    }
}

/// Immutable dispatch table of one device type.
pub struct FunctionTable<S> {
    type_name: String,
    capabilities: Capabilities,
    requests: HashMap<u8, RequestEntry<S>>,
    responses: HashMap<u8, PassthroughSpec<S>>,
    callbacks: HashMap<u8, PassthroughSpec<S>>,
    autoruns: Vec<AutorunSpec<S>>,
}

impl<S> FunctionTable<S> {
    /// Starts a table for the device type `type_name`.
    #[must_use]
    pub fn builder(type_name: impl Into<String>) -> FunctionTableBuilder<S>
    where
        S: Send + 'static,
    {
        FunctionTableBuilder::new(type_name)
    }

    /// Device type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Capabilities installed into the table.
    #[must_use]
    pub const fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Looks up a request entry.
    #[must_use]
    pub fn request(&self, function_id: u8) -> Option<&RequestEntry<S>> {
        self.requests.get(&function_id)
    }

    /// Looks up an upstream passthrough filter.
    #[must_use]
    pub fn upstream(&self, category: UpstreamCategory, function_id: u8) -> Option<&PassthroughSpec<S>> {
        match category {
            UpstreamCategory::Response => self.responses.get(&function_id),
            UpstreamCategory::Callback => self.callbacks.get(&function_id),
        }
    }

    /// Registered background tasks.
    #[must_use]
    pub fn autoruns(&self) -> &[AutorunSpec<S>] {
        &self.autoruns
    }

    /// IDs of all request entries, sorted.
    #[must_use]
    pub fn request_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.requests.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl<S> fmt::Debug for FunctionTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionTable")
            .field("type_name", &self.type_name)
            .field("capabilities", &self.capabilities)
            .field("requests", &self.request_ids())
            .field("responses", &self.responses.len())
            .field("callbacks", &self.callbacks.len())
            .field("autoruns", &self.autoruns.len())
            .finish()
    }
}

/// Builder for [`FunctionTable`].
pub struct FunctionTableBuilder<S> {
    table: FunctionTable<S>,
    error: Option<TableError>,
}

impl<S: Send + 'static> FunctionTableBuilder<S> {
    /// Creates an empty builder.
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            table: FunctionTable {
                type_name: type_name.into(),
                capabilities: Capabilities::default(),
                requests: HashMap::new(),
                responses: HashMap::new(),
                callbacks: HashMap::new(),
                autoruns: Vec::new(),
            },
            error: None,
        }
    }

    /// Registers a local function.
    ///
    /// `input` and `output` are whitespace-separated format specifiers.
    #[must_use]
    pub fn function<F, Fut>(self, function_id: u8, name: &str, input: &str, output: &str, handler: F) -> Self
    where
        F: Fn(DeviceContext<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<Outcome>> + Send + 'static,
    {
        self.checked_reserved(function_id, name)
            .add_function(function_id, name, input, output, function_handler(handler))
    }

    /// Registers a request-passthrough filter: the handler receives the
    /// unpacked request and returns whether to forward it upstream.
    #[must_use]
    pub fn passthrough_request<F, Fut>(self, function_id: u8, name: &str, format: &str, handler: F) -> Self
    where
        F: Fn(DeviceContext<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<bool>> + Send + 'static,
    {
        let mut this = self.checked_reserved(function_id, name);
        let Some(spec) = this.passthrough_spec(function_id, name, format, handler) else {
            return this;
        };
        if let Some(existing) = this.table.requests.get(&function_id) {
            let first = existing.name().to_string();
            return this.fail_duplicate(function_id, first, name);
        }
        this.table
            .requests
            .insert(function_id, RequestEntry::Passthrough(spec));
        this
    }

    /// Registers a filter for upstream responses to `function_id`.
    #[must_use]
    pub fn passthrough_response<F, Fut>(self, function_id: u8, name: &str, format: &str, handler: F) -> Self
    where
        F: Fn(DeviceContext<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<bool>> + Send + 'static,
    {
        self.add_upstream(UpstreamCategory::Response, function_id, name, format, handler)
    }

    /// Registers a filter for upstream callbacks with `callback_id`.
    #[must_use]
    pub fn passthrough_callback<F, Fut>(self, callback_id: u8, name: &str, format: &str, handler: F) -> Self
    where
        F: Fn(DeviceContext<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<bool>> + Send + 'static,
    {
        self.add_upstream(UpstreamCategory::Callback, callback_id, name, format, handler)
    }

    /// Registers a background task.
    #[must_use]
    pub fn autorun<F, Fut>(mut self, name: &str, task: F) -> Self
    where
        F: Fn(DeviceContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.table.autoruns.push(AutorunSpec {
            name: name.to_string(),
            handler: Arc::new(move |ctx: DeviceContext<S>| task(ctx).boxed()),
        });
        self
    }

    /// Installs enumerate (254) and get-identity (255).
    #[must_use]
    pub fn with_enumerate(mut self) -> Self {
        if self.table.capabilities.enumerate {
            return self;
        }
        self.table.capabilities.enumerate = true;
        capability::install_enumerate(self)
    }

    /// Installs the co-processor bootloader functions (235, 236, 239, 240).
    #[must_use]
    pub fn with_bootloader(mut self) -> Self {
        if self.table.capabilities.bootloader {
            return self;
        }
        self.table.capabilities.bootloader = true;
        capability::install_bootloader(self)
    }

    /// Finishes the table.
    ///
    /// # Errors
    ///
    /// Returns the first registration error.
    pub fn build(self) -> Result<FunctionTable<S>, TableError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.table),
        }
    }

    /// Registers a function without the reserved-ID check.
    pub(crate) fn add_function(
        mut self,
        function_id: u8,
        name: &str,
        input: &str,
        output: &str,
        handler: FunctionHandler<S>,
    ) -> Self {
        if self.error.is_some() {
            return self;
        }
        if function_id == 0 {
            let type_name = self.table.type_name.clone();
            return self.fail(TableError::ZeroFunctionId {
                type_name,
                name: name.to_string(),
            });
        }
        let Some(input) = self.parse_format(name, input) else {
            return self;
        };
        let Some(output) = self.parse_format(name, output) else {
            return self;
        };
        if let Some(existing) = self.table.requests.get(&function_id) {
            let first = existing.name().to_string();
            return self.fail_duplicate(function_id, first, name);
        }

        self.table.requests.insert(
            function_id,
            RequestEntry::Function(FunctionSpec {
                function_id,
                name: name.to_string(),
                input,
                output,
                handler,
            }),
        );
        self
    }

    fn add_upstream<F, Fut>(
        mut self,
        category: UpstreamCategory,
        function_id: u8,
        name: &str,
        format: &str,
        handler: F,
    ) -> Self
    where
        F: Fn(DeviceContext<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<bool>> + Send + 'static,
    {
        let Some(spec) = self.passthrough_spec(function_id, name, format, handler) else {
            return self;
        };
        let existing = self
            .table
            .responses
            .get(&function_id)
            .or_else(|| self.table.callbacks.get(&function_id));
        if let Some(existing) = existing {
            let first = existing.name.clone();
            return self.fail_duplicate(function_id, first, name);
        }

        match category {
            UpstreamCategory::Response => self.table.responses.insert(function_id, spec),
            UpstreamCategory::Callback => self.table.callbacks.insert(function_id, spec),
        };
        self
    }

    fn passthrough_spec<F, Fut>(
        &mut self,
        function_id: u8,
        name: &str,
        format: &str,
        handler: F,
    ) -> Option<PassthroughSpec<S>>
    where
        F: Fn(DeviceContext<S>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<bool>> + Send + 'static,
    {
        if self.error.is_some() {
            return None;
        }
        if function_id == 0 {
            self.error = Some(TableError::ZeroFunctionId {
                type_name: self.table.type_name.clone(),
                name: name.to_string(),
            });
            return None;
        }
        let format = self.parse_format(name, format)?;
        Some(PassthroughSpec {
            function_id,
            name: name.to_string(),
            format,
            handler: Arc::new(move |ctx: DeviceContext<S>, args: Args| handler(ctx, args).boxed()),
        })
    }

    fn parse_format(&mut self, name: &str, text: &str) -> Option<Format> {
        let format = match Format::parse(text) {
            Ok(format) => format,
            Err(source) => {
                self.error = Some(TableError::Format {
                    type_name: self.table.type_name.clone(),
                    name: name.to_string(),
                    source,
                });
                return None;
            },
        };
        if format.size() > MAX_PAYLOAD_LEN {
            self.error = Some(TableError::PayloadTooLarge {
                type_name: self.table.type_name.clone(),
                name: name.to_string(),
                size: format.size(),
            });
            return None;
        }
        Some(format)
    }

    fn checked_reserved(self, function_id: u8, name: &str) -> Self {
        if self.error.is_none() && RESERVED_FUNCTION_IDS.contains(&function_id) {
            let error = TableError::ReservedFunctionId {
                type_name: self.table.type_name.clone(),
                function_id,
                name: name.to_string(),
            };
            return self.fail(error);
        }
        self
    }

    fn fail_duplicate(self, function_id: u8, first: String, second: &str) -> Self {
        let error = TableError::DuplicateFunctionId {
            type_name: self.table.type_name.clone(),
            function_id,
            first,
            second: second.to_string(),
        };
        self.fail(error)
    }

    fn fail(mut self, error: TableError) -> Self {
        self.error.get_or_insert(error);
        self
    }
}
