mod commands;
mod pagination;
mod releases;
mod revalidation;
mod syncing;
mod utils;
