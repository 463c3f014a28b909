// 解封装与缓冲协调

pub mod abort_gate;
pub mod buffer_policy;
pub mod consumer;
pub mod coordinator;
pub mod demuxer_thread;
pub mod external_subtitle;
pub mod memory_reader;
pub mod packet_queue;
pub mod reader_factory;
pub mod replay_gain;
pub mod session;
pub mod stream_reader;
pub mod teardown;

pub use abort_gate::AbortGate;
pub use consumer::{ConsumerHandle, ConsumerLock};
pub use coordinator::DemuxCoordinator;
pub use demuxer_thread::DemuxerThread;
pub use external_subtitle::ExternalSubtitleFinder;
pub use memory_reader::{MemoryReader, MemorySource};
pub use packet_queue::{PacketQueue, PacketQueues};
pub use reader_factory::{ReaderFactory, ResolvedUrl, UrlResolver};
pub use session::{Consumers, PlaybackSession, SeekRequest, StreamBinder, StreamSelection};
pub use stream_reader::{AbortHandle, ReadPacket, StreamReader};
pub use teardown::{OwnerContext, OwnerHandle, TeardownRendezvous};
